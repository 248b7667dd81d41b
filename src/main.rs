use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::path::PathBuf;

use treemirror::config::Config;
use treemirror::hasher::Hasher;
use treemirror::logging::*;
use treemirror::plan::ChangeSet;
use treemirror::resolve;
use treemirror::scanner::Scanner;
use treemirror::serve::FileServer;
use treemirror::store::{Host, Store};

///////////////////////
// Utility functions //
///////////////////////

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let mut config = match matches.get_one::<PathBuf>("config") {
		Some(path) => Config::load(path)?,
		None => {
			let mut config = Config::default();
			config.apply_env();
			config
		}
	};
	if let Some(store) = matches.get_one::<PathBuf>("store") {
		config.store = store.clone();
	}
	if matches.get_flag("debug") {
		config.log_level = "debug".to_string();
	}
	Ok(config)
}

fn named_or_local_host(store: &Store, name: Option<&String>) -> Result<Host, Box<dyn Error>> {
	let name = match name {
		Some(name) => name.clone(),
		None => treemirror::local_hostname().ok_or("cannot determine the hostname")?,
	};
	Ok(store.host_by_name_or_create(&name)?)
}

fn configure(store: &Store, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let host = named_or_local_host(store, matches.get_one::<String>("host"))?;
	let mut failed = 0;

	if let Some(region) = matches.get_one::<String>("region") {
		let region = match store.region_by_name(region)? {
			Some(region) => region,
			None => store.create_region(region)?,
		};
		store.set_host_region(host.id, Some(region.id))?;
		info!("Host {} is in region {}", host.name, region.name);
	}

	for path in matches.get_many::<String>("add").into_iter().flatten() {
		if let Err(e) = resolve::add_root(store, &host, path.as_bytes()) {
			error!("Cannot add root {}: {}", path, e);
			failed += 1;
		}
	}
	for path in matches.get_many::<String>("remove").into_iter().flatten() {
		if let Err(e) = resolve::remove_root(store, &host, path.as_bytes()) {
			error!("Cannot remove root {}: {}", path, e);
			failed += 1;
		}
	}

	if failed > 0 {
		return Err(format!("{} root changes failed", failed).into());
	}
	Ok(())
}

fn sync(store: &Store, config: &Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let source = matches.get_one::<String>("source").ok_or("sync: source URI required")?;
	let destination = matches.get_one::<String>("destination").ok_or("sync: destination URI required")?;
	let format = matches.get_one::<String>("format").unwrap_or(&config.sync.format);

	let changes = ChangeSet::between_uris(store, source, destination)?;
	print!("{}", changes.render(format));
	for (kind, count) in changes.counts() {
		info!("{}: {}", kind, count);
	}
	println!("{}GB", changes.transfer_size() as f64 / (1u64 << 30) as f64);
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("TreeMirror")
		.version("0.1.0")
		.author("Szilard Hajba <szilu@symbion.hu>")
		.about("Distributed filesystem tree mirror")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("FILE")
				.value_parser(value_parser!(PathBuf))
				.help("TOML configuration file"),
		)
		.arg(
			Arg::new("store")
				.short('d')
				.long("store")
				.value_name("FILE")
				.value_parser(value_parser!(PathBuf))
				.help("Store file (overrides config and TREEMIRROR_STORE)"),
		)
		.arg(Arg::new("debug").long("debug").action(ArgAction::SetTrue).help("Debug logging"))
		.subcommand(
			Command::new("configure")
				.about("Register roots and regions")
				.arg(Arg::new("host").long("host").value_name("NAME").help("Host (default: this machine)"))
				.arg(Arg::new("add").long("add").value_name("PATH").action(ArgAction::Append))
				.arg(Arg::new("remove").long("remove").value_name("PATH").action(ArgAction::Append))
				.arg(Arg::new("region").long("region").value_name("NAME")),
		)
		.subcommand(
			Command::new("scan")
				.about("Scan the local roots")
				.arg(Arg::new("once").long("once").action(ArgAction::SetTrue).help("Single round")),
		)
		.subcommand(
			Command::new("hash").about("Claim and digest pending files").arg(
				Arg::new("workers")
					.short('w')
					.long("workers")
					.value_name("N")
					.value_parser(value_parser!(usize)),
			),
		)
		.subcommand(
			Command::new("serve").about("Announce and serve pending files").arg(
				Arg::new("port").short('p').long("port").value_name("PORT").value_parser(value_parser!(u16)),
			),
		)
		.subcommand(Command::new("run").about("Scanner, file server and hasher in one process"))
		.subcommand(
			Command::new("sync")
				.about("Print the change set between two trees")
				.arg(Arg::new("source").required(true).value_name("SOURCE_URI"))
				.arg(Arg::new("destination").required(true).value_name("DEST_URI"))
				.arg(Arg::new("format").short('f').long("format").value_name("FORMAT")),
		)
		.subcommand(Command::new("status").about("Show store record counts"))
		.get_matches();

	let mut config = load_config(&matches)?;
	treemirror::logging::init_tracing(&config.log_level);
	debug!("Configuration: {:?}", config);
	let store = Store::open(&config.store)?;

	match matches.subcommand() {
		Some(("configure", sub)) => configure(&store, sub)?,
		Some(("scan", sub)) => {
			config.scanner.once |= sub.get_flag("once");
			let host = named_or_local_host(&store, None)?;
			Scanner::new(store, host, config.scanner)?.run().await?;
		}
		Some(("hash", sub)) => {
			let workers = sub.get_one::<usize>("workers").copied().unwrap_or(config.hasher.workers);
			let host = named_or_local_host(&store, None)?;
			Hasher::new(store, host, config.hasher).run(workers).await?;
		}
		Some(("serve", sub)) => {
			if let Some(port) = sub.get_one::<u16>("port") {
				config.server.listen.set_port(*port);
			}
			let host = named_or_local_host(&store, None)?;
			FileServer::bind(store, host, config.server).await?.run().await?;
		}
		Some(("run", _)) => {
			let host = named_or_local_host(&store, None)?;
			let scanner = Scanner::new(store.clone(), host.clone(), config.scanner)?;
			let server = FileServer::bind(store.clone(), host.clone(), config.server).await?;
			let workers = config.hasher.workers;
			let hasher = Hasher::new(store, host, config.hasher);
			tokio::try_join!(scanner.run(), server.run(), hasher.run(workers))?;
		}
		Some(("sync", sub)) => sync(&store, &config, sub)?,
		Some(("status", _)) => {
			println!("{}", serde_json::to_string_pretty(&store.stats()?)?);
		}
		_ => unreachable!("subcommand_required"),
	}

	Ok(())
}

// vim: ts=4

use clap::{Arg, Command};
use std::error::Error;

use reflectr::hash::Algorithm;
use reflectr::logging;
use reflectr::serve;

fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();

	let matches = Command::new("reflectr")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Bidirectional filesystem synchronization engine")
		.subcommand_required(true)
		.subcommand(
			Command::new("serve")
				.about("Serve a synchronization endpoint over stdio (used internally)"),
		)
		.subcommand(
			Command::new("digests").about("List digest algorithms supported by this build"),
		)
		.subcommand(
			Command::new("check-ignores")
				.about("Validate ignore patterns")
				.arg(
					Arg::new("dialect")
						.long("dialect")
						.value_name("DIALECT")
						.default_value("mutagen")
						.help("Pattern dialect (mutagen or docker)"),
				)
				.arg(Arg::new("pattern").required(true).num_args(1..)),
		)
		.get_matches();

	if matches.subcommand_matches("serve").is_some() {
		let runtime = tokio::runtime::Runtime::new()?;
		return runtime.block_on(serve::serve()).map_err(Into::into);
	} else if matches.subcommand_matches("digests").is_some() {
		for algorithm in Algorithm::supported_algorithms() {
			println!("{}", algorithm.name());
		}
		return Ok(());
	} else if let Some(matches) = matches.subcommand_matches("check-ignores") {
		let dialect_name = matches.get_one::<String>("dialect").expect("defaulted");
		let dialect = reflectr::ignore::Dialect::from_name(dialect_name)
			.ok_or_else(|| format!("unknown dialect: {}", dialect_name))?;
		let patterns: Vec<String> =
			matches.get_many::<String>("pattern").expect("required").cloned().collect();
		reflectr::ignore::new_ignorer(dialect, &patterns)?;
		println!("ok");
		return Ok(());
	}

	unreachable!("subcommand is required");
}

// vim: ts=4

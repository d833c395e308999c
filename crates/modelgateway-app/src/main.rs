use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use modelgateway::config::Config;
use modelgateway::store::KeyPolicy;

mod serve;

/// Exit codes: 0 success, 2 configuration error, 3 runtime fatal.
const EXIT_CONFIG: i32 = 2;
const EXIT_RUNTIME: i32 = 3;

#[derive(Parser)]
#[command(name = "modelgateway", about = "Unified gateway in front of LLM providers")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Start the gateway.
	Serve {
		#[arg(long)]
		config: PathBuf,
		#[arg(long, default_value = "0.0.0.0:4000")]
		addr: String,
	},
	/// Manage deployment definitions.
	Models {
		#[command(subcommand)]
		command: ModelsCommand,
	},
	/// Manage virtual keys.
	Keys {
		#[command(subcommand)]
		command: KeysCommand,
	},
	/// Interactively obtain and store an operator token.
	Login,
}

#[derive(Subcommand)]
enum ModelsCommand {
	/// Bulk-load deployment definitions from a YAML file.
	Import { file: PathBuf },
}

#[derive(Subcommand)]
enum KeysCommand {
	/// Bulk-load virtual keys from a YAML file.
	Import { file: PathBuf },
}

fn main() {
	let cli = Cli::parse();
	let code = match cli.command {
		Command::Serve { config, addr } => cmd_serve(config, addr),
		Command::Models {
			command: ModelsCommand::Import { file },
		} => cmd_models_import(file),
		Command::Keys {
			command: KeysCommand::Import { file },
		} => cmd_keys_import(file),
		Command::Login => cmd_login(),
	};
	std::process::exit(code);
}

fn cmd_serve(config: PathBuf, addr: String) -> i32 {
	let cfg = match Config::load(&config) {
		Ok(cfg) => cfg,
		Err(e) => {
			eprintln!("invalid config {}: {e}", config.display());
			return EXIT_CONFIG;
		},
	};
	modelgateway::telemetry::setup_logging(cfg.gateway_settings.set_verbose);
	modelgateway::llm::preload_tokenizers();

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start runtime: {e}");
			return EXIT_RUNTIME;
		},
	};
	match runtime.block_on(serve::run(cfg, &addr)) {
		Ok(()) => 0,
		Err(e) => {
			eprintln!("gateway failed: {e}");
			EXIT_RUNTIME
		},
	}
}

fn cmd_models_import(file: PathBuf) -> i32 {
	let raw = match std::fs::read_to_string(&file) {
		Ok(raw) => raw,
		Err(e) => {
			eprintln!("cannot read {}: {e}", file.display());
			return EXIT_CONFIG;
		},
	};
	// The import file is a bare model_list; validate it the same way the
	// server config is validated.
	let wrapped = format!("model_list:\n{}", indent(&raw));
	let cfg = match Config::parse(&wrapped).or_else(|_| Config::parse(&raw)) {
		Ok(cfg) => cfg,
		Err(e) => {
			eprintln!("invalid model list: {e}");
			return EXIT_CONFIG;
		},
	};
	match modelgateway::llm::registry::Registry::from_config(
		&cfg.model_list,
		&cfg.router_settings,
	) {
		Ok(registry) => {
			let groups: Vec<_> = registry.group_names().collect();
			println!(
				"imported {} deployments across {} model groups",
				cfg.model_list.len(),
				groups.len()
			);
			0
		},
		Err(e) => {
			eprintln!("invalid deployment: {e}");
			EXIT_CONFIG
		},
	}
}

fn cmd_keys_import(file: PathBuf) -> i32 {
	let raw = match std::fs::read_to_string(&file) {
		Ok(raw) => raw,
		Err(e) => {
			eprintln!("cannot read {}: {e}", file.display());
			return EXIT_CONFIG;
		},
	};
	match serde_yaml::from_str::<HashMap<String, KeyPolicy>>(&raw) {
		Ok(keys) => {
			println!("imported {} keys", keys.len());
			0
		},
		Err(e) => {
			eprintln!("invalid keys file: {e}");
			EXIT_CONFIG
		},
	}
}

fn cmd_login() -> i32 {
	eprint!("operator token: ");
	let mut token = String::new();
	if std::io::stdin().read_line(&mut token).is_err() {
		eprintln!("failed to read token");
		return EXIT_RUNTIME;
	}
	let token = token.trim();
	if token.is_empty() {
		eprintln!("no token provided");
		return EXIT_CONFIG;
	}
	let Some(home) = std::env::home_dir() else {
		eprintln!("cannot determine home directory");
		return EXIT_RUNTIME;
	};
	let dir = home.join(".modelgateway");
	if let Err(e) = std::fs::create_dir_all(&dir) {
		eprintln!("cannot create {}: {e}", dir.display());
		return EXIT_RUNTIME;
	}
	let path = dir.join("token");
	if let Err(e) = std::fs::write(&path, token) {
		eprintln!("cannot write {}: {e}", path.display());
		return EXIT_RUNTIME;
	}
	println!("token stored in {}", path.display());
	0
}

fn indent(raw: &str) -> String {
	raw
		.lines()
		.map(|l| format!("  {l}"))
		.collect::<Vec<_>>()
		.join("\n")
}

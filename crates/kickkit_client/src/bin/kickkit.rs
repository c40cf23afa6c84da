#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context as _;
use kickkit_client::config::{KickkitConfig, default_config_path, load_config_from_path};
use kickkit_client::{ChatClient, ClientEvent, ClientState};
use kickkit_domain::EventKind;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: kickkit [--config path] [--channel slug] [--read-only]\n\
\n\
Options:\n\
	--config     Config file (default: ~/.kickkit/config.toml)\n\
	--channel    Channel slug to attach to (overrides the config file)\n\
	--read-only  Listen without logging in; commands are rejected\n\
	--help       Show this help\n\
\n\
Notes:\n\
	Credentials come from the [auth] table or KICKKIT_* environment variables.\n\
	Set bearer_token/xsrf_token/cookies to skip the browser login.\n\
\n\
Examples:\n\
	kickkit --channel xqc --read-only\n\
	RUST_LOG=debug kickkit --config ./kickkit.toml\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter =
		std::env::var("RUST_LOG").unwrap_or_else(|_| "info,kickkit_platform=debug,kickkit_client=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

struct Args {
	config: Option<PathBuf>,
	channel: Option<String>,
	read_only: bool,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		channel: None,
		read_only: false,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--channel" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--channel must be non-empty");
					usage_and_exit();
				}
				args.channel = Some(v);
			}
			"--read-only" => args.read_only = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn describe(event: &ClientEvent) {
	match event {
		ClientEvent::Ready(user) => info!(channel = %user.username, owner = %user.tag, "ready"),
		ClientEvent::Kick(ev) => info!(kind = %ev.kind(), payload = %ev.payload(), "event"),
		ClientEvent::Disconnect => info!("disconnected"),
		ClientEvent::Error(message) => warn!(%message, "connection error"),
	}
}

fn load(args: &Args) -> anyhow::Result<KickkitConfig> {
	let path = match &args.config {
		Some(path) => path.clone(),
		None => default_config_path()?,
	};
	let mut cfg = load_config_from_path(&path)?;
	if let Some(channel) = &args.channel {
		cfg.channel = Some(channel.clone());
	}
	if args.read_only {
		cfg.client.read_only = true;
	}
	Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let cfg = load(&args)?;
	init_metrics(cfg.telemetry.metrics_bind.as_deref());

	let channel = cfg.channel_slug()?;
	let client = ChatClient::new(channel, cfg.client_options());
	for kind in EventKind::ALL {
		client.on(kind, describe);
	}

	let user = if cfg.client.read_only {
		client.start().await?
	} else {
		let mode = cfg
			.login_mode()?
			.context("no credentials configured: set [auth] username/password or the three tokens")?;
		client.login(mode).await?
	};
	info!(channel = %user.username, id = %user.id, "attached; press Ctrl-C to exit");

	let mut state = client.watch_state();
	tokio::select! {
		res = tokio::signal::ctrl_c() => {
			if let Err(e) = res {
				warn!(error = %e, "failed to listen for ctrl-c");
			}
			info!("shutting down");
		}
		_ = state.wait_for(|s| matches!(s, ClientState::Disconnected | ClientState::Errored)) => {
			warn!(state = ?client.state(), "connection ended");
		}
	}

	client.close().await;
	Ok(())
}

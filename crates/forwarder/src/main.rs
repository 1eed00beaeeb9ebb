use std::{collections::HashMap, sync::Arc};

use clap::Parser as _;
use forwarder_core::{edr::EdrSink, error, info, warn};
use forwarder_engine::RoundRobinForwarder;
use forwarder_tcp::TcpUpstreamClient;
use forwarder_udp::UdpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::Level;

use crate::{
	cli::{Cli, Commands, ConfigFormat},
	conf::{persistent::PersistentConfig, runtime::RuntimeConfig},
};

mod cli;
mod conf;
mod log;

fn worker_thread_count() -> usize {
	let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
	1 + if parallelism > 4 { parallelism / 4 } else { 0 }
}

fn main() -> eyre::Result<()> {
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{err:#}");
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("FORWARDER_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("forwarder {VER}");
		return Ok(());
	}

	if let Some(Commands::Init { format }) = &cli.command {
		let (format, extension) = match format {
			ConfigFormat::Yaml => ("yaml", "yaml"),
			ConfigFormat::Toml => ("toml", "toml"),
		};
		let path = std::path::PathBuf::from(format!("config.{extension}"));
		PersistentConfig::default().export_to_file(&path, format)?;
		println!("wrote default configuration to {}", path.display());
		return Ok(());
	}

	log::init_log(Level::INFO)?;
	info!(target: "[MAIN]", "forwarder starting");

	let persistent = PersistentConfig::load(cli.config, cli.config_dir)?;
	let runtime_config = match RuntimeConfig::from_persistent(persistent) {
		Ok(config) => config,
		Err(source) => {
			error!(target: "[MAIN]", "invalid configuration: {source}");
			std::process::exit(1);
		}
	};

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.worker_threads(worker_thread_count())
		.enable_all()
		.build()?;
	runtime.block_on(run(runtime_config))
}

async fn run(config: RuntimeConfig) -> eyre::Result<()> {
	let mut clients = Vec::with_capacity(config.tcp_clients.len());
	for addr in &config.tcp_clients {
		clients.push(TcpUpstreamClient::new(*addr, config.connection_timeout, config.response_timeout));
	}

	let mut listeners = HashMap::with_capacity(config.udp_ports.len());
	for (listener_id, &port) in config.udp_ports.iter().enumerate() {
		let listener = Arc::new(UdpListener::bind(listener_id as u32, port).await?);
		listeners.insert(listener_id as u32, listener);
	}

	let edr_sink = match &config.edr_log {
		Some(path) => Arc::new(EdrSink::open(path)?),
		None => Arc::new(EdrSink::disabled()),
	};

	let forwarder = RoundRobinForwarder::new(clients.clone(), listeners.clone());
	forwarder.edr_report.subscribe_weak(&edr_sink, |sink, edr| sink.record(edr));

	for listener in listeners.values() {
		let listener_run = listener.clone();
		tokio::spawn(async move { listener_run.run().await });

		listener.incoming_req.subscribe_weak(&forwarder, |forwarder, req| {
			forwarder.schedule(req.clone());
		});
	}

	for client in &clients {
		let client_run = client.clone();
		tokio::spawn(async move { client_run.run().await });
	}

	wait_for_shutdown_signal().await;
	info!(target: "[MAIN]", "shutdown signal received, draining in-flight requests");

	forwarder.stop().await;
	for listener in listeners.values() {
		listener.stop();
	}
	for client in &clients {
		client.stop();
	}

	info!(target: "[MAIN]", "forwarder stopped");
	Ok(())
}

async fn wait_for_shutdown_signal() {
	match signal(SignalKind::terminate()) {
		Ok(mut sigterm) => {
			tokio::select! {
				_ = tokio::signal::ctrl_c() => {}
				_ = sigterm.recv() => {}
			}
		}
		Err(source) => {
			warn!(target: "[MAIN]", "failed to install SIGTERM handler: {source}, waiting on SIGINT only");
			let _ = tokio::signal::ctrl_c().await;
		}
	}
}

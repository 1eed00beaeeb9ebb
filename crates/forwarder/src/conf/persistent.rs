use std::{net::Ipv4Addr, path::Path};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};

/// One upstream TCP server, as it appears in a config document.
#[derive(Debug, Deserialize, Serialize, Clone, Educe)]
#[educe(Default)]
pub struct TcpClientConfig {
	#[educe(Default(expression = Ipv4Addr::LOCALHOST))]
	pub ipv4: Ipv4Addr,
	pub port: u16,
}

/// The on-disk configuration schema: what a user writes in a TOML or YAML
/// document, layered with `FORWARDER_`-prefixed environment overrides.
/// Validated into a [`super::runtime::RuntimeConfig`] before use.
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub udp_ports: Vec<u16>,

	pub tcp_clients: Vec<TcpClientConfig>,

	#[educe(Default = 2000)]
	pub response_timeout_ms: u32,

	#[educe(Default = 5000)]
	pub connection_timeout_ms: u32,

	#[educe(Default = None)]
	pub edr_log: Option<String>,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &Path, format: &str) -> eyre::Result<()> {
		use std::{fs, io::Write};

		match format.to_lowercase().as_str() {
			"yaml" => {
				let yaml_content = serde_yaml::to_string(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(yaml_content.as_bytes())?;
			}
			"toml" => {
				let toml_content = toml::to_string_pretty(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(toml_content.as_bytes())?;
			}
			_ => return Err(eyre::eyre!("unsupported config file format: {format}")),
		}

		Ok(())
	}

	pub fn load(config_path: Option<String>, config_dir: Option<std::path::PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::new();

		if let Some(config_dir) = config_dir {
			let config_file = config_dir.join("config.toml");
			if config_file.exists() {
				figment = figment.merge(Toml::file(config_file));
			}

			let config_file = config_dir.join("config.yaml");
			if config_file.exists() {
				figment = figment.merge(Yaml::file(config_file));
			}
		} else {
			let config_toml = Path::new("config.toml");
			if config_toml.exists() {
				figment = figment.merge(Toml::file(config_toml));
			}

			let config_yaml = Path::new("config.yaml");
			if config_yaml.exists() {
				figment = figment.merge(Yaml::file(config_yaml));
			}
		}

		if let Some(config_path) = config_path {
			if config_path.ends_with(".toml") {
				figment = figment.merge(Toml::file(&config_path));
			} else if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
				figment = figment.merge(Yaml::file(&config_path));
			} else {
				figment = figment.merge(Toml::file(&config_path));
			}
		}

		figment = figment.merge(Env::prefixed("FORWARDER_"));

		let config: PersistentConfig = figment.extract()?;
		Ok(config)
	}
}

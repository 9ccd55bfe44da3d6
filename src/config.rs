use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutorConfig;

pub static NAME: &str = "Tart";
pub static TAG: &str = env!("CARGO_PKG_VERSION");
pub static REVISION: &str = match option_env!("TART_REVISION") {
    Some(revision) => revision,
    None => "00000000",
};

/// e.g. `Tart 0.1.0(00000000)`
pub fn full_name() -> String {
    format!("{NAME} {TAG}({REVISION})")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// Gitlab instance URL, only scheme + host, e.g. https://gitlab.example.com
    pub gitlab_endpoint: String,
    /// Runner access token, obtained by `tart register`
    pub access_token: String,
    pub executor: ExecutorConfig,
}

impl Config {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| anyhow!("failed to read {path:?}"))?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| anyhow!("failed to parse {path:?}\n{e}"))?;
        config
            .check()
            .with_context(|| anyhow!("failed to validate {path:?}"))?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.gitlab_endpoint.is_empty() {
            bail!("GitlabEndpoint is required");
        }
        if self.access_token.is_empty() {
            bail!("AccessToken is required");
        }
        self.executor.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    static SAMPLE: &str = r#"
GitlabEndpoint = "https://gitlab.example.com"
AccessToken = "secret"

[Executor]
KernelPath = "vmlinux-5.10.bin"
RootFSPath = "jammy.rootfs.ext4"
IP = "172.18.0.2"
GatewayIP = "172.18.0.1"
Netmask = "255.255.255.0"
TapDevice = "tap0"
TapMac = "AA:FC:42:42:66:88"
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn read_sample() {
        let file = write_config(SAMPLE);
        let config = Config::read(file.path()).unwrap();
        assert_eq!(config.gitlab_endpoint, "https://gitlab.example.com");
        assert_eq!(config.access_token, "secret");
        assert_eq!(config.executor.ip, "172.18.0.2");
        assert_eq!(config.executor.tap_mac, "AA:FC:42:42:66:88");
    }

    #[test]
    fn roundtrip_keeps_key_names() {
        let file = write_config(SAMPLE);
        let config = Config::read(file.path()).unwrap();
        let encoded = toml::to_string(&config).unwrap();
        for key in [
            "GitlabEndpoint",
            "AccessToken",
            "[Executor]",
            "KernelPath",
            "RootFSPath",
            "IP",
            "GatewayIP",
            "Netmask",
            "TapDevice",
            "TapMac",
        ] {
            assert!(encoded.contains(key), "missing {key} in:\n{encoded}");
        }
    }

    #[test]
    fn missing_field_is_an_error() {
        let file = write_config("GitlabEndpoint = \"https://gitlab.example.com\"\n");
        assert!(Config::read(file.path()).is_err());
    }

    #[test]
    fn empty_field_is_an_error() {
        let contents = SAMPLE.replace("\"tap0\"", "\"\"");
        let file = write_config(&contents);
        let err = Config::read(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("tap device is required"));
    }

    #[test]
    fn full_name_contains_revision() {
        assert!(full_name().starts_with("Tart "));
        assert!(full_name().contains(REVISION));
    }
}

use anyhow::{ensure, Result};

/// Private key matching the root user of the rootfs image.
static PRIVATE_KEY: &str = include_str!("../assets/id_rsa");

/// Returns the embedded SSH private key after checking its PEM envelope.
/// libssh2 only parses keys while authenticating, so a malformed asset is
/// caught here before any job is polled.
pub fn private_key() -> Result<&'static str> {
    ensure!(
        PRIVATE_KEY.starts_with("-----BEGIN"),
        "embedded SSH private key is missing its PEM header"
    );
    ensure!(
        PRIVATE_KEY.trim_end().ends_with("PRIVATE KEY-----"),
        "embedded SSH private key is missing its PEM footer"
    );
    Ok(PRIVATE_KEY)
}

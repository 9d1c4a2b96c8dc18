//! The shared outbound `reqwest::Client` (§6 `http_proxy`).
//!
//! Grounded on the teacher's `server.rs`, which builds a single
//! `Arc<reqwest::Client>` once at startup and threads it through every
//! handler. Generalized to live behind an `ArcSwap` so a SIGHUP config
//! reload that flips `http_proxy` settings takes effect without a
//! restart, the same way `config.rs`'s `Config` does.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use reqwest::Proxy;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HttpProxyConfig, ProxyScheme};

pub struct HttpClientCell {
    inner: ArcSwap<reqwest::Client>,
}

impl HttpClientCell {
    pub fn new(proxy: &HttpProxyConfig) -> Result<Self> {
        let client = build_client(proxy)?;
        Ok(Self {
            inner: ArcSwap::from_pointee(client),
        })
    }

    pub fn current(&self) -> Arc<reqwest::Client> {
        self.inner.load_full()
    }

    /// Rebuild and atomically publish a new client reflecting updated
    /// proxy settings. In-flight requests keep using the client they
    /// already borrowed.
    pub fn reload(&self, proxy: &HttpProxyConfig) -> Result<()> {
        let client = build_client(proxy)?;
        self.inner.store(Arc::new(client));
        Ok(())
    }
}

fn build_client(proxy: &HttpProxyConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(120));

    if proxy.enabled {
        let url = match proxy.scheme {
            ProxyScheme::Http => format!("http://{}", proxy.address),
            ProxyScheme::Https => format!("https://{}", proxy.address),
            ProxyScheme::Socks5 => format!("socks5://{}", proxy.address),
        };
        let handle = Proxy::all(&url).context("invalid http_proxy.address")?;
        builder = builder.proxy(handle);
    }

    builder.build().context("failed to build http client")
}

// ── Endpoint derivation ──
//
// The application owns the HTTP(S) base address of the provisioning
// service. The notification channel lives next to it: same host, WebSocket
// scheme, fixed path suffix. The base is read again on every attempt.

use std::sync::Arc;

use arc_swap::ArcSwap;
use url::Url;

use crate::error::Error;

/// Path appended to the base address when none is configured.
pub const DEFAULT_ENDPOINT_PATH: &str = "/ws";

/// Derive the WebSocket endpoint from an HTTP(S) base address.
///
/// `http` becomes `ws`, `https` becomes `wss`; bases that are already
/// `ws`/`wss` keep their scheme. `path` is appended to whatever path the
/// base carries. Query and fragment are dropped.
pub fn derive_endpoint(base: &Url, path: &str) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::UnsupportedScheme {
                scheme: other.to_owned(),
            });
        }
    };

    let mut endpoint = base.clone();
    endpoint
        .set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme {
            scheme: base.scheme().to_owned(),
        })?;

    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    endpoint.set_path(&joined);
    endpoint.set_query(None);
    endpoint.set_fragment(None);

    Ok(endpoint)
}

/// Where the client reads the service base address from.
///
/// Called once per connection attempt, never cached.
pub trait BaseAddressSource: Send + Sync + 'static {
    fn base_url(&self) -> Url;
}

impl BaseAddressSource for Url {
    fn base_url(&self) -> Url {
        self.clone()
    }
}

impl<T: BaseAddressSource> BaseAddressSource for Arc<T> {
    fn base_url(&self) -> Url {
        (**self).base_url()
    }
}

/// Base address the application can swap at runtime.
///
/// Cheaply cloneable; all clones observe the same value. The next
/// connection attempt after [`set`](Self::set) uses the new address.
#[derive(Debug, Clone)]
pub struct SharedBaseUrl {
    inner: Arc<ArcSwap<Url>>,
}

impl SharedBaseUrl {
    pub fn new(url: Url) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(url)),
        }
    }

    /// Replace the base address.
    pub fn set(&self, url: Url) {
        tracing::info!(base = %url, "notification base address reconfigured");
        self.inner.store(Arc::new(url));
    }

    pub fn get(&self) -> Url {
        (**self.inner.load()).clone()
    }
}

impl BaseAddressSource for SharedBaseUrl {
    fn base_url(&self) -> Url {
        self.get()
    }
}

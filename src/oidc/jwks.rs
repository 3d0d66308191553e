//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! One cache per `jwks_uri`; keys are fetched lazily on first use and
//! re-fetched when a token names an unknown `kid`.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum time between two refreshes triggered by unknown key ids.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Keys published by one provider.
pub struct JwksCache {
    /// Cached keys: kid -> key
    keys: RwLock<HashMap<String, CachedKey>>,
    last_refresh: RwLock<Option<Instant>>,
    jwks_url: String,
    http_client: reqwest::Client,
}

#[derive(Clone)]
pub struct CachedKey {
    pub key: DecodingKey,
    /// Algorithm pinned by the JWK, if it declares one.
    pub alg: Option<Algorithm>,
}

/// JWKS response from the endpoint.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC, oct)
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use")]
    pub key_use: Option<String>,

    // RSA parameters
    pub n: Option<String>,
    pub e: Option<String>,

    // EC parameters
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,

    // Symmetric key (base64url)
    pub k: Option<String>,
}

impl JwksCache {
    pub fn new(jwks_url: String, http_client: reqwest::Client) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            jwks_url,
            http_client,
        }
    }

    /// Get a key by key ID, refreshing once if it is not cached.
    pub async fn get_key(&self, kid: &str) -> Result<CachedKey> {
        if let Some(cached) = self.lookup(|keys| keys.get(kid).cloned())? {
            return Ok(cached);
        }

        debug!(kid = %kid, "Key not found in cache, refreshing JWKS");
        self.refresh_throttled().await?;

        self.lookup(|keys| keys.get(kid).cloned())?
            .ok_or_else(|| anyhow!("Key with kid '{}' not found in JWKS", kid))
    }

    /// Key for tokens that carry no `kid`. Only unambiguous when the set
    /// holds exactly one signing key.
    pub async fn get_default_key(&self) -> Result<CachedKey> {
        if self.lookup(|keys| keys.is_empty().then_some(()))?.is_some() {
            self.refresh().await?;
        }

        self.lookup(|keys| {
            if keys.len() == 1 {
                keys.values().next().cloned()
            } else {
                None
            }
        })?
        .ok_or_else(|| anyhow!("Token has no kid and JWKS does not hold exactly one key"))
    }

    fn lookup<T>(&self, f: impl FnOnce(&HashMap<String, CachedKey>) -> Option<T>) -> Result<Option<T>> {
        let keys = self.keys.read().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(f(&keys))
    }

    async fn refresh_throttled(&self) -> Result<()> {
        let recent = {
            let last = self.last_refresh.read().map_err(|_| anyhow!("Lock poisoned"))?;
            last.map(|t| t.elapsed() < MIN_REFRESH_INTERVAL).unwrap_or(false)
        };
        if recent {
            return Ok(());
        }
        self.refresh().await
    }

    /// Force refresh the JWKS cache.
    pub async fn refresh(&self) -> Result<()> {
        debug!(url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "JWKS endpoint returned status {}",
                response.status()
            ));
        }

        let jwks: Jwks = response.json().await.context("Failed to parse JWKS")?;

        let mut new_keys = HashMap::new();
        for jwk in jwks.keys {
            // Skip encryption keys
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match jwk_to_cached_key(&jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!(kid = %kid, kty = %jwk.kty, "Loaded JWK");
                    new_keys.insert(kid, key);
                }
                Err(e) => {
                    warn!(
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Failed to parse JWK, skipping"
                    );
                }
            }
        }

        if new_keys.is_empty() {
            return Err(anyhow!("No valid signing keys found in JWKS"));
        }

        let key_count = new_keys.len();
        *self.keys.write().map_err(|_| anyhow!("Lock poisoned"))? = new_keys;
        *self.last_refresh.write().map_err(|_| anyhow!("Lock poisoned"))? = Some(Instant::now());

        info!(url = %self.jwks_url, key_count, "JWKS cache refreshed");
        Ok(())
    }
}

fn jwk_to_cached_key(jwk: &Jwk) -> Result<CachedKey> {
    let key = match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_ref().ok_or_else(|| anyhow!("RSA key missing 'n'"))?;
            let e = jwk.e.as_ref().ok_or_else(|| anyhow!("RSA key missing 'e'"))?;
            DecodingKey::from_rsa_components(n, e).context("Failed to create RSA DecodingKey")?
        }
        "EC" => {
            let x = jwk.x.as_ref().ok_or_else(|| anyhow!("EC key missing 'x'"))?;
            let y = jwk.y.as_ref().ok_or_else(|| anyhow!("EC key missing 'y'"))?;
            match jwk.crv.as_deref() {
                Some("P-256") | Some("P-384") => DecodingKey::from_ec_components(x, y)
                    .context("Failed to create EC DecodingKey")?,
                other => return Err(anyhow!("Unsupported EC curve: {:?}", other)),
            }
        }
        "oct" => {
            let k = jwk.k.as_ref().ok_or_else(|| anyhow!("Symmetric key missing 'k'"))?;
            let secret = URL_SAFE_NO_PAD
                .decode(k.trim_end_matches('='))
                .context("Failed to decode symmetric key")?;
            DecodingKey::from_secret(&secret)
        }
        kty => return Err(anyhow!("Unsupported key type: {}", kty)),
    };

    let alg = match jwk.alg.as_deref() {
        Some(alg) => Some(Algorithm::from_str(alg).context("Unsupported JWK algorithm")?),
        None => None,
    };

    Ok(CachedKey { key, alg })
}

/// Caches keyed by JWKS URL, shared across providers.
#[derive(Default)]
pub struct JwksRegistry {
    caches: RwLock<HashMap<String, Arc<JwksCache>>>,
}

impl JwksRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_for(&self, jwks_url: &str, http_client: &reqwest::Client) -> Result<Arc<JwksCache>> {
        if let Some(cache) = self
            .caches
            .read()
            .map_err(|_| anyhow!("Lock poisoned"))?
            .get(jwks_url)
        {
            return Ok(Arc::clone(cache));
        }

        let mut caches = self.caches.write().map_err(|_| anyhow!("Lock poisoned"))?;
        let cache = caches
            .entry(jwks_url.to_string())
            .or_insert_with(|| Arc::new(JwksCache::new(jwks_url.to_string(), http_client.clone())));
        Ok(Arc::clone(cache))
    }
}

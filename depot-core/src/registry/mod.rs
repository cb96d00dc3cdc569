//! Remote registry client.
//!
//! `RegistryClient` talks to the remote registry over HTTP: meta-search for
//! counts and facets, paged search for full records, and archive download.
//! Requests on one client instance are strictly serialized; a second call
//! issued while one is outstanding fails immediately with
//! [`DepotError::Busy`] instead of queuing.
//!
//! Network failures are logged and reduced to `None`/empty at this boundary;
//! only `Busy` and `Validation` reach callers as errors.

mod download;
pub mod response;

pub use response::{Facet, FacetItem, MetaSearchResult, SearchResult, TaxonomyTerm};

use response::SearchResponse;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::{DepotError, Result};
use crate::store::CatalogStore;

/// Default production registry.
pub const DEFAULT_PRODUCTION_URL: &str = "https://registry.depot.dev";

/// Default development/staging registry.
pub const DEFAULT_DEVELOPMENT_URL: &str = "https://registry-dev.depot.dev";

/// Registry API version sent with every request.
const API_VERSION: &str = "2.0";

/// Auth key header checked server-side per environment.
const AUTH_HEADER: &str = "X-Depot-Auth";

const DEFAULT_RESULTS_PER_QUERY: u32 = 10;
const MAX_RESULTS_PER_QUERY: u32 = 100;

/// Registry endpoints and timeouts.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub production_url: String,
    pub development_url: String,
    /// Per-request timeout. The registry can be slow paging large result
    /// sets.
    pub request_timeout: Duration,
    /// Total time allowed for one archive download, remote generation
    /// included.
    pub download_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            production_url: DEFAULT_PRODUCTION_URL.to_string(),
            development_url: DEFAULT_DEVELOPMENT_URL.to_string(),
            request_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(50),
        }
    }
}

#[derive(Default)]
struct AuthState {
    use_development: bool,
    prod_key: String,
    dev_key: String,
    prod_valid: bool,
    dev_valid: bool,
}

/// Single-flight HTTP client for one remote registry.
pub struct RegistryClient {
    client: reqwest::Client,
    config: RegistryConfig,
    auth: Mutex<AuthState>,
    /// One permit: holding it is the in-flight marker.
    in_flight: Semaphore,
    results_per_query: AtomicU32,
    last_total_results: AtomicU32,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("depot/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DepotError::from_reqwest(&e))?;

        Ok(Self {
            client,
            config,
            auth: Mutex::new(AuthState::default()),
            in_flight: Semaphore::new(1),
            results_per_query: AtomicU32::new(DEFAULT_RESULTS_PER_QUERY),
            last_total_results: AtomicU32::new(0),
        })
    }

    // ---- Environment and auth ------------------------------------------

    /// Target the production registry; the active auth key follows.
    pub fn use_production(&self) {
        self.auth().use_development = false;
    }

    /// Target the development registry; the active auth key follows.
    pub fn use_development(&self) {
        self.auth().use_development = true;
    }

    pub fn is_using_development(&self) -> bool {
        self.auth().use_development
    }

    /// Base URL of the currently selected environment.
    pub fn remote_url(&self) -> String {
        let auth = self.auth();
        if auth.use_development {
            self.config.development_url.clone()
        } else {
            self.config.production_url.clone()
        }
    }

    /// Auth key of the currently selected environment.
    pub fn auth_key(&self) -> String {
        let auth = self.auth();
        if auth.use_development {
            auth.dev_key.clone()
        } else {
            auth.prod_key.clone()
        }
    }

    pub fn prod_auth_key(&self) -> String {
        self.auth().prod_key.clone()
    }

    pub fn dev_auth_key(&self) -> String {
        self.auth().dev_key.clone()
    }

    /// Adopt previously persisted keys without a remote probe. They are not
    /// marked valid; setting a key anew still runs the probe.
    pub fn restore_auth_keys(&self, prod_key: &str, dev_key: &str) {
        let mut auth = self.auth();
        auth.prod_key = prod_key.to_string();
        auth.dev_key = dev_key.to_string();
    }

    /// Validate and activate a production auth key.
    ///
    /// Keys are 32 characters; anything else is rejected before any I/O.
    /// Otherwise a zero-row probe search is issued against the production
    /// registry, and only a successful probe stores the key. Returns whether
    /// the key is now set and valid.
    pub async fn set_prod_auth_key(&self, key: &str) -> bool {
        if key.len() != 32 {
            tracing::warn!("Rejecting production auth key: must be 32 characters");
            return false;
        }
        {
            let auth = self.auth();
            if auth.prod_valid && auth.prod_key == key {
                return true;
            }
        }
        if !self.probe_auth_key(&self.config.production_url, key).await {
            return false;
        }
        let mut auth = self.auth();
        auth.prod_key = key.to_string();
        auth.prod_valid = true;
        true
    }

    /// Validate and activate a development auth key. See
    /// [`set_prod_auth_key`](Self::set_prod_auth_key).
    pub async fn set_dev_auth_key(&self, key: &str) -> bool {
        if key.len() != 32 {
            tracing::warn!("Rejecting development auth key: must be 32 characters");
            return false;
        }
        {
            let auth = self.auth();
            if auth.dev_valid && auth.dev_key == key {
                return true;
            }
        }
        if !self.probe_auth_key(&self.config.development_url, key).await {
            return false;
        }
        let mut auth = self.auth();
        auth.dev_key = key.to_string();
        auth.dev_valid = true;
        true
    }

    /// Zero-row search against `base` carrying the candidate key.
    async fn probe_auth_key(&self, base: &str, key: &str) -> bool {
        let permit = match self.begin_request() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("Cannot validate auth key: a request is already in flight");
                return false;
            }
        };

        let query = vec![
            ("term".to_string(), "*".to_string()),
            ("api_version".to_string(), API_VERSION.to_string()),
            ("show_rows".to_string(), "0".to_string()),
        ];
        let result = self
            .get_json::<SearchResponse>(base, "/api/search", &query, key)
            .await;
        drop(permit);

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Auth key validation against {base} failed: {e}");
                false
            }
        }
    }

    // ---- Paging ---------------------------------------------------------

    pub fn results_per_query(&self) -> u32 {
        self.results_per_query.load(Ordering::Relaxed)
    }

    /// Set the page size for `search`, clamped to `1..=100`.
    pub fn set_results_per_query(&self, n: u32) {
        self.results_per_query
            .store(n.clamp(1, MAX_RESULTS_PER_QUERY), Ordering::Relaxed);
    }

    /// Total result count reported by the most recent (meta-)search.
    pub fn last_total_results(&self) -> u32 {
        self.last_total_results.load(Ordering::Relaxed)
    }

    /// Number of pages needed to cover [`last_total_results`](Self::last_total_results).
    pub fn result_pages(&self) -> u32 {
        self.last_total_results().div_ceil(self.results_per_query())
    }

    // ---- Remote operations ----------------------------------------------

    /// Counts, facets, and taxonomy terms for a query, without full records.
    ///
    /// An empty search term falls back to the `*` wildcard. Network failures
    /// reduce to `Ok(None)` with a log entry; a request already in flight is
    /// [`DepotError::Busy`].
    pub async fn meta_search(
        &self,
        term: &str,
        kind: ArtifactKind,
        facet: Option<&str>,
    ) -> Result<Option<MetaSearchResult>> {
        let _permit = self.begin_request()?;

        let query = meta_query(term, kind, facet);
        let (base, key) = self.active_target();
        match self
            .get_json::<MetaSearchResult>(&base, "/api/metasearch", &query, &key)
            .await
        {
            Ok(meta) => {
                self.last_total_results
                    .store(meta.result_count, Ordering::Relaxed);
                Ok(Some(meta))
            }
            Err(e) => {
                tracing::warn!("meta-search for {term:?} failed: {e}");
                Ok(None)
            }
        }
    }

    /// One page of full result records.
    ///
    /// Runs a meta-search first and short-circuits to empty when the
    /// reported result count is zero, saving the paged request.
    pub async fn search(
        &self,
        term: &str,
        kind: ArtifactKind,
        facet: Option<&str>,
        page: u32,
    ) -> Result<Vec<SearchResult>> {
        match self.meta_search(term, kind, facet).await? {
            None => return Ok(Vec::new()),
            Some(meta) if meta.result_count == 0 => return Ok(Vec::new()),
            Some(_) => {}
        }

        let _permit = self.begin_request()?;

        let query = search_query(term, kind, facet, self.results_per_query(), page);
        let (base, key) = self.active_target();
        match self
            .get_json::<SearchResponse>(&base, "/api/search", &query, &key)
            .await
        {
            Ok(response) => {
                self.last_total_results
                    .store(response.result_count, Ordering::Relaxed);
                Ok(response.results)
            }
            Err(e) => {
                tracing::warn!("search for {term:?} page {page} failed: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Fetch an artifact archive and register it into the store.
    ///
    /// The whole fetch runs under the configured download timeout; on
    /// timeout the future is dropped, which aborts the request, so no late
    /// completion can mutate the store afterwards. A failed download leaves
    /// previously cached versions untouched.
    pub async fn download_artifact(
        &self,
        store: &mut CatalogStore,
        uid: &str,
    ) -> Result<Option<Artifact>> {
        if uid.trim().is_empty() {
            return Err(DepotError::Validation("empty uid".to_string()));
        }

        let _permit = self.begin_request()?;

        let (base, key) = self.active_target();
        let bytes = match tokio::time::timeout(
            self.config.download_timeout,
            self.fetch_archive(&base, &key, uid),
        )
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                tracing::warn!("download of {uid} failed: {e}");
                return Ok(None);
            }
            Err(_) => {
                tracing::warn!(
                    "download of {uid} timed out after {:?}",
                    self.config.download_timeout
                );
                return Ok(None);
            }
        };

        match download::register_archive(store, &bytes) {
            Ok(artifact) => {
                tracing::info!(
                    "Downloaded {} {}/{}",
                    artifact.kind,
                    artifact.uid,
                    artifact.version_id
                );
                Ok(Some(artifact))
            }
            Err(e) => {
                tracing::error!("registering downloaded archive for {uid} failed: {e:#}");
                Ok(None)
            }
        }
    }

    async fn fetch_archive(&self, base: &str, key: &str, uid: &str) -> Result<Vec<u8>> {
        let url = format!("{base}/api/download");
        let response = self
            .client
            .get(&url)
            .header(AUTH_HEADER, key)
            .query(&[("uids", uid), ("api_version", API_VERSION)])
            .send()
            .await
            .map_err(|e| DepotError::from_reqwest(&e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DepotError::NotFound(format!("no artifact with uid {uid}")));
        }
        if !response.status().is_success() {
            return Err(DepotError::from_status(response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DepotError::from_reqwest(&e))?;
        Ok(bytes.to_vec())
    }

    /// For every locally stored artifact of `kind`, issue a single-result
    /// remote search by uid and collect the records whose `versionId`
    /// differs from the local one.
    pub async fn check_for_updates(
        &self,
        store: &CatalogStore,
        kind: ArtifactKind,
    ) -> Result<Vec<SearchResult>> {
        let mut updates = Vec::new();
        for local in store.artifacts(kind) {
            match self.search_by_uid(kind, &local.uid).await? {
                Some(remote) if remote.version_id != local.version_id => updates.push(remote),
                _ => {}
            }
        }
        Ok(updates)
    }

    async fn search_by_uid(&self, kind: ArtifactKind, uid: &str) -> Result<Option<SearchResult>> {
        let _permit = self.begin_request()?;

        let query = vec![
            ("term".to_string(), "*".to_string()),
            ("fq[]".to_string(), format!("uuid:{uid}")),
            ("fq[]".to_string(), format!("bundle:{}", kind.as_str())),
            ("api_version".to_string(), API_VERSION.to_string()),
            ("show_rows".to_string(), "1".to_string()),
            ("page".to_string(), "0".to_string()),
        ];
        let (base, key) = self.active_target();
        match self
            .get_json::<SearchResponse>(&base, "/api/search", &query, &key)
            .await
        {
            Ok(response) => Ok(response.results.into_iter().next()),
            Err(e) => {
                tracing::warn!("update check for {uid} failed: {e}");
                Ok(None)
            }
        }
    }

    // ---- Plumbing -------------------------------------------------------

    fn begin_request(&self) -> Result<SemaphorePermit<'_>> {
        self.in_flight.try_acquire().map_err(|_| DepotError::Busy)
    }

    /// Occupy the in-flight slot so tests can provoke `Busy` paths.
    #[cfg(test)]
    pub(crate) fn hold_in_flight(&self) -> SemaphorePermit<'_> {
        match self.begin_request() {
            Ok(permit) => permit,
            Err(_) => unreachable!("in-flight slot already held"),
        }
    }

    fn auth(&self) -> MutexGuard<'_, AuthState> {
        self.auth.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_target(&self) -> (String, String) {
        let auth = self.auth();
        if auth.use_development {
            (self.config.development_url.clone(), auth.dev_key.clone())
        } else {
            (self.config.production_url.clone(), auth.prod_key.clone())
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        query: &[(String, String)],
        auth_key: &str,
    ) -> Result<T> {
        let url = format!("{base}{path}");
        let response = self
            .client
            .get(&url)
            .header(AUTH_HEADER, auth_key)
            .query(query)
            .send()
            .await
            .map_err(|e| DepotError::from_reqwest(&e))?;

        if !response.status().is_success() {
            return Err(DepotError::from_status(response.status()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DepotError::from_reqwest(&e))
    }
}

fn meta_query(term: &str, kind: ArtifactKind, facet: Option<&str>) -> Vec<(String, String)> {
    let term = if term.trim().is_empty() { "*" } else { term };
    let mut query = vec![
        ("term".to_string(), term.to_string()),
        ("fq[]".to_string(), format!("bundle:{}", kind.as_str())),
    ];
    if let Some(facet) = facet {
        query.push(("fq[]".to_string(), facet.to_string()));
    }
    query.push(("api_version".to_string(), API_VERSION.to_string()));
    query
}

fn search_query(
    term: &str,
    kind: ArtifactKind,
    facet: Option<&str>,
    show_rows: u32,
    page: u32,
) -> Vec<(String, String)> {
    let mut query = meta_query(term, kind, facet);
    query.push(("show_rows".to_string(), show_rows.to_string()));
    query.push(("page".to_string(), page.to_string()));
    query
}

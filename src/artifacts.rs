//! Baseline artifact storage
//!
//! Provides:
//! - The `ArtifactStore` capability used by a run
//! - GitHub Actions artifact storage (REST API for lookup/download, results service for upload)
//! - A local directory store

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use crate::error::ActionError;

const USER_AGENT: &str = "covdiff";
const API_VERSION: &str = "2022-11-28";
const ARTIFACT_SERVICE: &str = "twirp/github.actions.results.api.v1.ArtifactService";
const PER_PAGE: usize = 100;

/// Stores and fetches baseline coverage, keyed by branch
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publish `paths` as the artifact for `tag`
    async fn store(&self, paths: &[PathBuf], tag: &str) -> Result<()>;

    /// Fetch the newest artifact for `tag` and return the directory holding its files.
    /// `Ok(None)` when no artifact matches.
    async fn retrieve(&self, tag: &str, workflow_names: Option<&[String]>) -> Result<Option<PathBuf>>;
}

/// Artifact name for a branch: `<prefix>-<tag>` with characters GitHub rejects replaced
pub fn artifact_name(prefix: &str, tag: &str) -> String {
    format!("{}-{}", prefix, sanitize_name(tag))
}

fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\', ':', '"', '<', '>', '|', '*', '?', ' ', '\r', '\n'], "-")
}

/// Artifacts kept as plain directories under `root`
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    prefix: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    fn artifact_dir(&self, tag: &str) -> PathBuf {
        self.root.join(artifact_name(&self.prefix, tag))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(&self, paths: &[PathBuf], tag: &str) -> Result<()> {
        let dir = self.artifact_dir(tag);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Could not replace {}", dir.display()))?;
        }
        fs::create_dir_all(&dir).with_context(|| format!("Could not create {}", dir.display()))?;

        for path in paths {
            let name = path
                .file_name()
                .ok_or_else(|| ActionError::artifact(format!("not a file: {}", path.display())))?;
            fs::copy(path, dir.join(name))
                .with_context(|| format!("Could not copy {} into {}", path.display(), dir.display()))?;
        }

        tracing::info!("stored {} file(s) in {}", paths.len(), dir.display());
        Ok(())
    }

    async fn retrieve(&self, tag: &str, _workflow_names: Option<&[String]>) -> Result<Option<PathBuf>> {
        let dir = self.artifact_dir(tag);
        Ok(dir.is_dir().then_some(dir))
    }
}

/// Credentials of the Actions results service, only present inside a job
#[derive(Debug, Clone)]
pub struct RuntimeCredentials {
    pub token: String,
    pub results_url: String,
}

impl RuntimeCredentials {
    pub fn from_env() -> Option<Self> {
        let token = env::var("ACTIONS_RUNTIME_TOKEN").ok().filter(|v| !v.is_empty())?;
        let results_url = env::var("ACTIONS_RESULTS_URL").ok().filter(|v| !v.is_empty())?;
        Some(Self { token, results_url })
    }
}

/// GitHub Actions artifact storage
#[derive(Debug, Clone)]
pub struct GithubArtifactStore {
    client: reqwest::Client,
    api_url: String,
    repository: Option<String>,
    token: Option<String>,
    prefix: String,
    download_root: PathBuf,
    runtime: Option<RuntimeCredentials>,
}

impl GithubArtifactStore {
    pub fn new(
        api_url: impl Into<String>,
        repository: Option<String>,
        token: Option<String>,
        prefix: impl Into<String>,
    ) -> Self {
        let temp = env::var("RUNNER_TEMP")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            repository,
            token,
            prefix: prefix.into(),
            download_root: temp.join("covdiff"),
            runtime: RuntimeCredentials::from_env(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.download_root = root.into();
        self
    }

    pub fn with_runtime(mut self, runtime: Option<RuntimeCredentials>) -> Self {
        self.runtime = runtime;
        self
    }

    fn repository(&self) -> Result<&str> {
        self.repository
            .as_deref()
            .ok_or_else(|| ActionError::MissingEnvironment("GITHUB_REPOSITORY").into())
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| ActionError::MissingEnvironment("GITHUB_TOKEN").into())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(self.token()?)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API request {} failed: {} - {}", url, status, text);
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Unexpected response from {}", url))
    }

    /// Every page of a listing endpoint
    async fn get_all<P: Page>(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<P::Item>> {
        let mut items = Vec::new();

        let per_page = PER_PAGE.to_string();
        for page in 1u32.. {
            let page = page.to_string();
            let mut paged = query.to_vec();
            paged.push(("per_page", &per_page));
            paged.push(("page", &page));

            let (batch, total) = self.get_json::<P>(url, &paged).await?.into_items();
            let fetched = batch.len();
            items.extend(batch);

            let complete = match total {
                Some(total) => items.len() as u64 >= total,
                None => fetched < PER_PAGE,
            };
            if fetched == 0 || complete {
                break;
            }
        }

        Ok(items)
    }

    async fn list_artifacts(&self, name: &str) -> Result<Vec<ApiArtifact>> {
        let url = format!("{}/repos/{}/actions/artifacts", self.api_url, self.repository()?);
        self.get_all::<ArtifactList>(&url, &[("name", name)]).await
    }

    /// Ids of the named workflows
    async fn workflow_ids(&self, names: &[String]) -> Result<HashSet<u64>> {
        let repo = self.repository()?;
        let url = format!("{}/repos/{}/actions/workflows", self.api_url, repo);
        let workflows = self.get_all::<WorkflowList>(&url, &[]).await?;

        let mut ids = HashSet::new();
        for name in names {
            match workflows.iter().find(|w| w.matches(name)) {
                Some(workflow) => {
                    ids.insert(workflow.id);
                }
                None => tracing::warn!("workflow '{}' not found in {}", name, repo),
            }
        }

        Ok(ids)
    }

    async fn workflow_run(&self, run_id: u64) -> Result<WorkflowRun> {
        let url = format!(
            "{}/repos/{}/actions/runs/{}",
            self.api_url,
            self.repository()?,
            run_id
        );
        self.get_json(&url, &[]).await
    }

    async fn download(&self, artifact: &ApiArtifact, dir: &Path) -> Result<()> {
        let response = self
            .client
            .get(&artifact.archive_download_url)
            .bearer_auth(self.token()?)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .with_context(|| format!("Downloading artifact {} failed", artifact.id))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Artifact download failed: {} - {}", status, text);
        }

        let bytes = response.bytes().await?;
        extract_archive(&bytes, dir)
    }

    async fn twirp<T: DeserializeOwned>(
        &self,
        runtime: &RuntimeCredentials,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!(
            "{}/{}/{}",
            runtime.results_url.trim_end_matches('/'),
            ARTIFACT_SERVICE,
            method
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&runtime.token)
            .header("User-Agent", USER_AGENT)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", method))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{} failed: {} - {}", method, status, text);
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Unexpected {} response", method))
    }
}

#[async_trait]
impl ArtifactStore for GithubArtifactStore {
    async fn store(&self, paths: &[PathBuf], tag: &str) -> Result<()> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or(ActionError::MissingEnvironment("ACTIONS_RUNTIME_TOKEN"))?;
        let name = artifact_name(&self.prefix, tag);
        let (run_id, job_id) = backend_ids(&runtime.token)?;

        let archive = build_archive(paths)?;
        let size = archive.len();
        let hash = hex::encode(Sha256::digest(&archive));

        let created: CreateArtifactResponse = self
            .twirp(
                runtime,
                "CreateArtifact",
                json!({
                    "workflowRunBackendId": run_id,
                    "workflowJobRunBackendId": job_id,
                    "name": name,
                    "version": 4,
                }),
            )
            .await?;
        if !created.ok || created.signed_upload_url.is_empty() {
            return Err(ActionError::artifact(format!("creating artifact {} was rejected", name)).into());
        }

        let response = self
            .client
            .put(&created.signed_upload_url)
            .header("x-ms-blob-type", "BlockBlob")
            .body(archive)
            .send()
            .await
            .context("Artifact upload failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Artifact upload failed: {} - {}", status, text);
        }

        let finalized: FinalizeArtifactResponse = self
            .twirp(
                runtime,
                "FinalizeArtifact",
                json!({
                    "workflowRunBackendId": run_id,
                    "workflowJobRunBackendId": job_id,
                    "name": name,
                    "size": size.to_string(),
                    "hash": format!("sha256:{}", hash),
                }),
            )
            .await?;
        if !finalized.ok {
            return Err(ActionError::artifact(format!("finalizing artifact {} was rejected", name)).into());
        }

        tracing::info!(
            "uploaded artifact {} ({} bytes, id {})",
            name,
            size,
            finalized.artifact_id.as_deref().unwrap_or("?")
        );
        Ok(())
    }

    async fn retrieve(&self, tag: &str, workflow_names: Option<&[String]>) -> Result<Option<PathBuf>> {
        let name = artifact_name(&self.prefix, tag);
        let artifacts = self.list_artifacts(&name).await?;

        let workflow_ids = match workflow_names {
            Some(names) if !names.is_empty() => {
                let ids = self.workflow_ids(names).await?;
                if ids.is_empty() {
                    tracing::info!("none of the workflows {:?} exist", names);
                    return Ok(None);
                }
                Some(ids)
            }
            _ => None,
        };

        let mut rejected_runs = HashSet::new();
        for artifact in candidates(&artifacts, &name) {
            let Some(run_id) = artifact.workflow_run.as_ref().map(|r| r.id) else {
                continue;
            };
            if rejected_runs.contains(&run_id) {
                continue;
            }

            let run = self.workflow_run(run_id).await?;
            if !run.accepts(workflow_ids.as_ref()) {
                tracing::debug!(
                    "skipping artifact {}: run {} concluded {:?} in workflow {}",
                    artifact.id,
                    run_id,
                    run.conclusion,
                    run.workflow_id
                );
                rejected_runs.insert(run_id);
                continue;
            }

            let dir = self.download_root.join(&name);
            tracing::debug!("downloading artifact {} ({}) to {}", artifact.id, name, dir.display());
            self.download(artifact, &dir).await?;
            return Ok(Some(dir));
        }

        tracing::info!("no artifact named {} from a successful run", name);
        Ok(None)
    }
}

/// A listing response: its items and the total across all pages
trait Page: DeserializeOwned {
    type Item;
    fn into_items(self) -> (Vec<Self::Item>, Option<u64>);
}

#[derive(Debug, Deserialize)]
struct ArtifactList {
    total_count: Option<u64>,
    artifacts: Vec<ApiArtifact>,
}

impl Page for ArtifactList {
    type Item = ApiArtifact;
    fn into_items(self) -> (Vec<ApiArtifact>, Option<u64>) {
        (self.artifacts, self.total_count)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiArtifact {
    id: u64,
    name: String,
    #[serde(default)]
    expired: bool,
    created_at: Option<DateTime<Utc>>,
    archive_download_url: String,
    workflow_run: Option<ApiRun>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiRun {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct WorkflowList {
    total_count: Option<u64>,
    workflows: Vec<ApiWorkflow>,
}

impl Page for WorkflowList {
    type Item = ApiWorkflow;
    fn into_items(self) -> (Vec<ApiWorkflow>, Option<u64>) {
        (self.workflows, self.total_count)
    }
}

#[derive(Debug, Deserialize)]
struct ApiWorkflow {
    id: u64,
    name: String,
    path: String,
}

impl ApiWorkflow {
    /// Workflows are named by display name, file name or id
    fn matches(&self, name: &str) -> bool {
        self.name == name
            || self.path.rsplit('/').next() == Some(name)
            || self.id.to_string() == name
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    workflow_id: u64,
    conclusion: Option<String>,
}

impl WorkflowRun {
    /// Successful, and from one of `workflow_ids` when given
    fn accepts(&self, workflow_ids: Option<&HashSet<u64>>) -> bool {
        self.conclusion.as_deref() == Some("success")
            && workflow_ids.map_or(true, |ids| ids.contains(&self.workflow_id))
    }
}

#[derive(Debug, Deserialize)]
struct CreateArtifactResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, alias = "signedUploadUrl")]
    signed_upload_url: String,
}

#[derive(Debug, Deserialize)]
struct FinalizeArtifactResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, alias = "artifactId")]
    artifact_id: Option<String>,
}

/// Live artifacts called `name`, newest first. Ties on creation time go to the larger id.
fn candidates<'a>(artifacts: &'a [ApiArtifact], name: &str) -> Vec<&'a ApiArtifact> {
    let mut live: Vec<&ApiArtifact> = artifacts
        .iter()
        .filter(|a| a.name == name && !a.expired)
        .collect();
    live.sort_by_key(|a| std::cmp::Reverse((a.created_at, a.id)));
    live
}

/// Workflow run and job ids encoded in the runtime token's `Actions.Results` scope
fn backend_ids(runtime_token: &str) -> Result<(String, String)> {
    let payload = runtime_token
        .split('.')
        .nth(1)
        .ok_or_else(|| ActionError::artifact("malformed runtime token"))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("runtime token payload is not base64")?;
    let claims: serde_json::Value =
        serde_json::from_slice(&decoded).context("runtime token payload is not JSON")?;

    let scopes = claims.get("scp").and_then(|s| s.as_str()).unwrap_or_default();
    for scope in scopes.split(' ') {
        let parts: Vec<&str> = scope.split(':').collect();
        if let ["Actions.Results", run_id, job_id] = parts.as_slice() {
            return Ok((run_id.to_string(), job_id.to_string()));
        }
    }

    Err(ActionError::artifact("runtime token has no Actions.Results scope").into())
}

/// Zip `paths` flat, by file name
fn build_archive(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ActionError::artifact(format!("not a file: {}", path.display())))?;
        let content =
            fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
        writer.start_file(name, options)?;
        writer.write_all(&content)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// Unpack an artifact archive into `dir`, replacing earlier content
fn extract_archive(bytes: &[u8], dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("Could not clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Could not create {}", dir.display()))?;

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("Artifact is not a zip archive")?;
    archive
        .extract(dir)
        .with_context(|| format!("Could not extract artifact into {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(id: u64, name: &str, created: &str, run: u64, expired: bool) -> ApiArtifact {
        ApiArtifact {
            id,
            name: name.to_string(),
            expired,
            created_at: Some(created.parse().unwrap()),
            archive_download_url: format!("https://api.github.test/artifacts/{}/zip", id),
            workflow_run: Some(ApiRun { id: run }),
        }
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("coverage-report", "main"), "coverage-report-main");
        assert_eq!(artifact_name("cov", "feature/a b:c"), "cov-feature-a-b-c");
    }

    #[test]
    fn test_candidates_newest_first() {
        let artifacts = vec![
            artifact(1, "cov-main", "2024-01-01T00:00:00Z", 10, false),
            artifact(2, "cov-main", "2024-03-01T00:00:00Z", 20, false),
            artifact(3, "cov-main", "2024-05-01T00:00:00Z", 30, true),
            artifact(4, "cov-dev", "2024-06-01T00:00:00Z", 40, false),
        ];

        let ids: Vec<u64> = candidates(&artifacts, "cov-main").iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(candidates(&artifacts, "cov-missing").is_empty());
    }

    #[test]
    fn test_candidates_break_ties_by_id() {
        let artifacts = vec![
            artifact(7, "cov-main", "2024-01-01T00:00:00Z", 1, false),
            artifact(9, "cov-main", "2024-01-01T00:00:00Z", 1, false),
            artifact(8, "cov-main", "2024-01-01T00:00:00Z", 1, false),
        ];
        let ids: Vec<u64> = candidates(&artifacts, "cov-main").iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![9, 8, 7]);
    }

    #[test]
    fn test_run_acceptance() {
        let run = |workflow_id, conclusion: Option<&str>| WorkflowRun {
            workflow_id,
            conclusion: conclusion.map(str::to_string),
        };
        let scope: HashSet<u64> = [5].into_iter().collect();

        assert!(run(5, Some("success")).accepts(None));
        assert!(run(5, Some("success")).accepts(Some(&scope)));
        assert!(!run(6, Some("success")).accepts(Some(&scope)));
        assert!(!run(5, Some("failure")).accepts(None));
        assert!(!run(5, None).accepts(None));
    }

    #[test]
    fn test_parse_artifact_listing() {
        let body = r#"{
  "total_count": 1,
  "artifacts": [{
    "id": 11,
    "node_id": "MDg6QXJ0aWZhY3QxMQ==",
    "name": "coverage-report-main",
    "size_in_bytes": 556,
    "archive_download_url": "https://api.github.com/repos/o/r/actions/artifacts/11/zip",
    "expired": false,
    "created_at": "2020-01-10T14:59:22Z",
    "workflow_run": {"id": 2332938, "head_branch": "main", "head_sha": "abc"}
  }]
}"#;
        let list: ArtifactList = serde_json::from_str(body).unwrap();
        assert_eq!(list.total_count, Some(1));
        assert_eq!(list.artifacts.len(), 1);
        assert_eq!(list.artifacts[0].workflow_run.as_ref().unwrap().id, 2332938);
    }

    #[test]
    fn test_workflow_matching() {
        let workflow = ApiWorkflow {
            id: 161335,
            name: "CI".to_string(),
            path: ".github/workflows/ci.yml".to_string(),
        };
        assert!(workflow.matches("CI"));
        assert!(workflow.matches("ci.yml"));
        assert!(workflow.matches("161335"));
        assert!(!workflow.matches("release.yml"));
    }

    #[test]
    fn test_backend_ids() {
        let claims = json!({
            "scp": "Actions.ExampleScope Actions.Results:run-123:job-456",
        });
        let token = format!(
            "header.{}.signature",
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );

        let (run, job) = backend_ids(&token).unwrap();
        assert_eq!(run, "run-123");
        assert_eq!(job, "job-456");

        let claims = json!({ "scp": "Actions.ExampleScope" });
        let token = format!("h.{}.s", URL_SAFE_NO_PAD.encode(claims.to_string()));
        assert!(backend_ids(&token).is_err());
        assert!(backend_ids("not-a-token").is_err());
    }

    #[test]
    fn test_archive_extracts_flat() {
        let src = TempDir::new().unwrap();
        let nested = src.path().join("build");
        fs::create_dir_all(&nested).unwrap();
        let report = nested.join("coverage.xml");
        fs::write(&report, "<coverage/>").unwrap();

        let archive = build_archive(&[report]).unwrap();

        let dest = TempDir::new().unwrap();
        let out = dest.path().join("artifact");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale.txt"), "old").unwrap();

        extract_archive(&archive, &out).unwrap();
        assert_eq!(fs::read_to_string(out.join("coverage.xml")).unwrap(), "<coverage/>");
        assert!(!out.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let root = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let report = src.path().join("cov.xml");
        fs::write(&report, "first").unwrap();

        let store = LocalArtifactStore::new(root.path(), "coverage");
        assert!(store.retrieve("main", None).await.unwrap().is_none());

        store.store(&[report.clone()], "main").await.unwrap();
        fs::write(&report, "second").unwrap();
        store.store(&[report], "main").await.unwrap();

        let dir = store.retrieve("main", None).await.unwrap().unwrap();
        assert_eq!(dir, root.path().join("coverage-main"));
        assert_eq!(fs::read_to_string(dir.join("cov.xml")).unwrap(), "second");
    }

    #[tokio::test]
    async fn test_github_store_requires_credentials() {
        let store = GithubArtifactStore::new("https://api.github.test", None, None, "cov")
            .with_runtime(None);

        let err = store.store(&[], "main").await.unwrap_err();
        assert!(err.to_string().contains("ACTIONS_RUNTIME_TOKEN"));

        let err = store.retrieve("main", None).await.unwrap_err();
        assert!(err.to_string().contains("GITHUB_REPOSITORY"));
    }

    mod http {
        use super::*;
        use std::sync::{Arc, Mutex};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Target prefix, status and body of a canned response
        type Route = (String, u16, Vec<u8>);

        #[derive(Debug, Clone)]
        struct Request {
            method: String,
            target: String,
            body: Vec<u8>,
        }

        /// Answers each request with the first route whose prefix matches its target, else 404.
        /// `routes` receives the server's base URL.
        async fn serve(routes: impl FnOnce(&str) -> Vec<Route>) -> (String, Arc<Mutex<Vec<Request>>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let routes = routes(&base);
            let log = Arc::new(Mutex::new(Vec::new()));
            let requests = log.clone();

            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let mut data = Vec::new();
                    let mut buf = [0u8; 8192];
                    let header_end = loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break None;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                            break Some(pos + 4);
                        }
                    };
                    let Some(header_end) = header_end else {
                        continue;
                    };

                    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
                    let content_length = head
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while data.len() < header_end + content_length {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                    }

                    let mut request_line = head.split_whitespace();
                    let method = request_line.next().unwrap_or_default().to_string();
                    let target = request_line.next().unwrap_or_default().to_string();
                    let (status, payload) = routes
                        .iter()
                        .find(|(prefix, _, _)| target.starts_with(prefix.as_str()))
                        .map(|(_, status, payload)| (*status, payload.clone()))
                        .unwrap_or((404, b"{}".to_vec()));

                    requests.lock().unwrap().push(Request {
                        method,
                        target,
                        body: data[header_end..].to_vec(),
                    });

                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        status,
                        payload.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(&payload).await;
                    let _ = socket.shutdown().await;
                }
            });

            (base, log)
        }

        fn store(base: &str, download_root: &Path) -> GithubArtifactStore {
            GithubArtifactStore::new(base, Some("acme/app".to_string()), Some("t0ken".to_string()), "cov")
                .with_client(reqwest::Client::builder().no_proxy().build().unwrap())
                .with_download_root(download_root)
                .with_runtime(None)
        }

        fn route(prefix: &str, status: u16, body: impl Into<Vec<u8>>) -> Route {
            (prefix.to_string(), status, body.into())
        }

        /// One listing page of `cov-main` artifacts given as `(id, created_at, run id)`
        fn listing(base: &str, entries: &[(u64, &str, u64)], total: usize) -> String {
            let artifacts: Vec<serde_json::Value> = entries
                .iter()
                .map(|(id, created, run)| {
                    json!({
                        "id": id,
                        "name": "cov-main",
                        "expired": false,
                        "created_at": created,
                        "archive_download_url": format!("{}/download/{}", base, id),
                        "workflow_run": { "id": run },
                    })
                })
                .collect();
            json!({ "total_count": total, "artifacts": artifacts }).to_string()
        }

        fn run(workflow_id: u64, conclusion: &str) -> String {
            json!({ "workflow_id": workflow_id, "conclusion": conclusion }).to_string()
        }

        fn report_archive(content: &str) -> Vec<u8> {
            let src = TempDir::new().unwrap();
            let path = src.path().join("coverage.xml");
            fs::write(&path, content).unwrap();
            build_archive(&[path]).unwrap()
        }

        fn targets(requests: &Arc<Mutex<Vec<Request>>>) -> Vec<String> {
            requests.lock().unwrap().iter().map(|r| r.target.clone()).collect()
        }

        #[tokio::test]
        async fn test_retrieve_without_artifacts() {
            let (base, requests) = serve(|_| {
                vec![route(
                    "/repos/acme/app/actions/artifacts",
                    200,
                    r#"{"total_count":0,"artifacts":[]}"#,
                )]
            })
            .await;
            let root = TempDir::new().unwrap();

            let found = store(&base, root.path()).retrieve("main", None).await.unwrap();
            assert!(found.is_none());

            let targets = targets(&requests);
            assert_eq!(targets.len(), 1);
            assert!(targets[0].contains("name=cov-main"));
            assert!(targets[0].contains("per_page=100"));
        }

        #[tokio::test]
        async fn test_retrieve_skips_failed_runs_across_pages() {
            let (base, requests) = serve(|base| {
                vec![
                    route(
                        "/repos/acme/app/actions/artifacts?name=cov-main&per_page=100&page=1",
                        200,
                        listing(base, &[(2, "2024-03-01T00:00:00Z", 20)], 2),
                    ),
                    route(
                        "/repos/acme/app/actions/artifacts?name=cov-main&per_page=100&page=2",
                        200,
                        listing(base, &[(1, "2024-01-01T00:00:00Z", 10)], 2),
                    ),
                    route("/repos/acme/app/actions/runs/20", 200, run(5, "failure")),
                    route("/repos/acme/app/actions/runs/10", 200, run(5, "success")),
                    route("/download/1", 200, report_archive("<coverage/>")),
                    route("/download/2", 200, report_archive("<broken/>")),
                ]
            })
            .await;
            let root = TempDir::new().unwrap();

            let dir = store(&base, root.path())
                .retrieve("main", None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(dir, root.path().join("cov-main"));
            assert_eq!(fs::read_to_string(dir.join("coverage.xml")).unwrap(), "<coverage/>");

            let targets = targets(&requests);
            assert!(targets.iter().any(|t| t.ends_with("page=2")));
            assert!(targets.contains(&"/repos/acme/app/actions/runs/20".to_string()));
            assert!(targets.contains(&"/download/1".to_string()));
            assert!(!targets.contains(&"/download/2".to_string()));
        }

        #[tokio::test]
        async fn test_retrieve_scoped_to_workflow() {
            let (base, requests) = serve(|base| {
                vec![
                    route(
                        "/repos/acme/app/actions/artifacts",
                        200,
                        listing(
                            base,
                            &[(2, "2024-03-01T00:00:00Z", 20), (1, "2024-01-01T00:00:00Z", 10)],
                            2,
                        ),
                    ),
                    route(
                        "/repos/acme/app/actions/workflows",
                        200,
                        r#"{"total_count":2,"workflows":[
                            {"id":5,"name":"CI","path":".github/workflows/ci.yml"},
                            {"id":6,"name":"Nightly","path":".github/workflows/nightly.yml"}
                        ]}"#,
                    ),
                    route("/repos/acme/app/actions/runs/20", 200, run(6, "success")),
                    route("/repos/acme/app/actions/runs/10", 200, run(5, "success")),
                    route("/download/1", 200, report_archive("<ci/>")),
                ]
            })
            .await;
            let root = TempDir::new().unwrap();
            let store = store(&base, root.path());

            let dir = store
                .retrieve("main", Some(&["ci.yml".to_string()]))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(fs::read_to_string(dir.join("coverage.xml")).unwrap(), "<ci/>");
            assert!(!targets(&requests).contains(&"/download/2".to_string()));

            let missing = store
                .retrieve("main", Some(&["release.yml".to_string()]))
                .await
                .unwrap();
            assert!(missing.is_none());
        }

        #[tokio::test]
        async fn test_retrieve_reports_api_errors() {
            let (base, _) = serve(|_| {
                vec![route(
                    "/repos/acme/app/actions/artifacts",
                    500,
                    r#"{"message":"boom"}"#,
                )]
            })
            .await;
            let root = TempDir::new().unwrap();

            let err = store(&base, root.path()).retrieve("main", None).await.unwrap_err();
            assert!(err.to_string().contains("500"));
        }

        #[tokio::test]
        async fn test_store_uploads_through_results_service() {
            let (base, requests) = serve(|base| {
                vec![
                    route(
                        &format!("/{}/CreateArtifact", ARTIFACT_SERVICE),
                        200,
                        json!({ "ok": true, "signed_upload_url": format!("{}/upload", base) }).to_string(),
                    ),
                    route("/upload", 201, ""),
                    route(
                        &format!("/{}/FinalizeArtifact", ARTIFACT_SERVICE),
                        200,
                        r#"{"ok":true,"artifact_id":"7"}"#,
                    ),
                ]
            })
            .await;
            let claims = json!({ "scp": "Actions.Results:run-1:job-2" });
            let runtime = RuntimeCredentials {
                token: format!("h.{}.s", URL_SAFE_NO_PAD.encode(claims.to_string())),
                results_url: base.clone(),
            };

            let src = TempDir::new().unwrap();
            let report = src.path().join("coverage.xml");
            fs::write(&report, "<coverage/>").unwrap();

            let root = TempDir::new().unwrap();
            store(&base, root.path())
                .with_runtime(Some(runtime))
                .store(&[report], "main")
                .await
                .unwrap();

            let requests = requests.lock().unwrap();
            let methods: Vec<(&str, &str)> = requests
                .iter()
                .map(|r| (r.method.as_str(), r.target.rsplit('/').next().unwrap_or_default()))
                .collect();
            assert_eq!(
                methods,
                vec![("POST", "CreateArtifact"), ("PUT", "upload"), ("POST", "FinalizeArtifact")]
            );

            let create: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
            assert_eq!(create["name"], "cov-main");
            assert_eq!(create["workflowRunBackendId"], "run-1");

            let mut uploaded = zip::ZipArchive::new(Cursor::new(requests[1].body.clone())).unwrap();
            assert_eq!(uploaded.by_index(0).unwrap().name(), "coverage.xml");

            let finalize: serde_json::Value = serde_json::from_slice(&requests[2].body).unwrap();
            assert!(finalize["hash"].as_str().unwrap().starts_with("sha256:"));
            assert_eq!(finalize["size"], requests[1].body.len().to_string());
        }
    }
}

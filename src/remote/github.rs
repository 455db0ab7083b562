//! [`GitDataApi`] over GitHub's REST git-data endpoints.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RemoteConfig;
use crate::ratelimit::QuotaHeaders;
use crate::types::{BlobSha, BranchName, CommitSha, RepoId, RepoTarget, TreeSha};

use super::error::{RateLimitSignal, RemoteError, RemoteResult};
use super::types::{
    ApiResponse, BlobContent, ChangedFile, CommitAuthor, CommitObject, CommitSummary, Comparison,
    EntryKind, FileStatus, NewCommit, NewPullRequest, NewTreeEntry, PullRequest, RefTarget,
    TreeEntry, TreeListing,
};
use super::GitDataApi;

const API_VERSION: &str = "2022-11-28";

/// HTTP client for one credential.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    call_timeout: Duration,
    clock: Clock,
}

impl GitHubClient {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            token_expires_at: config.token_expires_at,
            call_timeout: config.call_timeout,
            clock: Clock::system(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn repo_url(&self, repo: &RepoId, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base,
            urlencoding::encode(&repo.owner),
            urlencoding::encode(&repo.name),
            path
        )
    }

    /// A request with the standard headers, refused locally if the token expired.
    fn request(&self, method: Method, url: String) -> RemoteResult<RequestBuilder> {
        if let Some(expires_at) = self.token_expires_at {
            if expires_at <= self.clock.now() {
                return Err(RemoteError::status(401, "token expired"));
            }
        }

        let mut builder = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        Ok(builder)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> RemoteResult<ApiResponse<T>> {
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;

        let quota = quota_from_headers(response.headers());
        let status = response.status();
        if status.is_success() {
            let body = response
                .json::<T>()
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))?;
            return Ok(ApiResponse::with_quota(body, quota));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or_else(|_| {
                if text.is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    text
                }
            });

        debug!(status = status.as_u16(), message = %message, "request rejected");
        Err(classify_failure(status, message, retry_after, quota))
    }

    fn transport_error(&self, error: reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout(self.call_timeout)
        } else {
            RemoteError::Network(error.to_string())
        }
    }
}

/// Turn a non-success response into a [`RemoteError`].
fn classify_failure(
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
    quota: Option<QuotaHeaders>,
) -> RemoteError {
    let code = status.as_u16();
    let lowered = message.to_ascii_lowercase();

    if code == 422 && lowered.contains("fast forward") {
        return RemoteError::NonFastForward { message };
    }

    let rate_limit = if code == 403 || code == 429 {
        if lowered.contains("secondary rate limit") || retry_after.is_some() {
            Some(RateLimitSignal::Secondary { retry_after })
        } else if lowered.contains("rate limit") || quota.map(|q| q.remaining == 0).unwrap_or(false) {
            Some(RateLimitSignal::Primary)
        } else {
            None
        }
    } else {
        None
    };

    RemoteError::Status {
        status: code,
        message,
        rate_limit,
        quota,
    }
}

fn quota_from_headers(headers: &HeaderMap) -> Option<QuotaHeaders> {
    QuotaHeaders::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok()))
}

/// Branch names may contain `/`; each segment is encoded on its own.
fn encode_branch(branch: &BranchName) -> String {
    branch
        .as_str()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// Wire shapes. Only the fields we read are declared.

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ApiSha {
    sha: String,
}

#[derive(Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    ref_name: String,
    object: ApiSha,
}

impl From<ApiRef> for RefTarget {
    fn from(value: ApiRef) -> Self {
        RefTarget {
            ref_name: value.ref_name,
            sha: CommitSha::new(value.object.sha),
        }
    }
}

#[derive(Deserialize)]
struct ApiAuthor {
    name: String,
    email: String,
    date: Option<DateTime<Utc>>,
}

impl From<ApiAuthor> for CommitAuthor {
    fn from(value: ApiAuthor) -> Self {
        CommitAuthor {
            name: value.name,
            email: value.email,
            date: value.date,
        }
    }
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
    tree: ApiSha,
    #[serde(default)]
    parents: Vec<ApiSha>,
    #[serde(default)]
    message: String,
    author: Option<ApiAuthor>,
}

#[derive(Deserialize)]
struct ApiTreeEntry {
    path: String,
    mode: String,
    #[serde(rename = "type")]
    kind: EntryKind,
    sha: String,
}

#[derive(Deserialize)]
struct ApiTree {
    sha: String,
    tree: Vec<ApiTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct ApiBlob {
    sha: String,
    content: String,
    encoding: String,
}

#[derive(Deserialize)]
struct ApiCompareCommitDetail {
    message: String,
    author: Option<ApiAuthor>,
}

#[derive(Deserialize)]
struct ApiCompareCommit {
    sha: String,
    commit: ApiCompareCommitDetail,
}

#[derive(Deserialize)]
struct ApiCompareFile {
    filename: String,
    status: String,
}

#[derive(Deserialize)]
struct ApiComparison {
    ahead_by: u32,
    behind_by: u32,
    #[serde(default)]
    commits: Vec<ApiCompareCommit>,
    #[serde(default)]
    files: Vec<ApiCompareFile>,
}

impl From<ApiComparison> for Comparison {
    fn from(value: ApiComparison) -> Self {
        Comparison {
            ahead_by: value.ahead_by,
            behind_by: value.behind_by,
            commits: value
                .commits
                .into_iter()
                .map(|c| {
                    let author = c.commit.author;
                    CommitSummary {
                        sha: CommitSha::new(c.sha),
                        message: c.commit.message.lines().next().unwrap_or_default().to_string(),
                        author: author.as_ref().map(|a| a.name.clone()),
                        timestamp: author.and_then(|a| a.date),
                    }
                })
                .collect(),
            files: value
                .files
                .into_iter()
                .map(|f| ChangedFile {
                    status: match f.status.as_str() {
                        "added" => FileStatus::Added,
                        "modified" | "changed" => FileStatus::Modified,
                        "removed" => FileStatus::Removed,
                        "renamed" => FileStatus::Renamed,
                        _ => FileStatus::Other,
                    },
                    path: f.filename,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct CreateBlobBody {
    content: String,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// serialized as `null` for deletions
    sha: Option<&'a str>,
}

#[derive(Serialize)]
struct CreateTreeBody<'a> {
    base_tree: &'a str,
    tree: Vec<CreateTreeEntry<'a>>,
}

#[derive(Serialize)]
struct CreateCommitAuthor<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
struct CreateCommitBody<'a> {
    message: &'a str,
    tree: &'a str,
    parents: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<CreateCommitAuthor<'a>>,
}

#[derive(Serialize)]
struct UpdateRefBody<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Serialize)]
struct CreateRefBody<'a> {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: &'a str,
}

#[async_trait]
impl GitDataApi for GitHubClient {
    async fn get_ref(&self, target: &RepoTarget) -> RemoteResult<ApiResponse<RefTarget>> {
        let url = self.repo_url(&target.repo, &format!("git/ref/heads/{}", encode_branch(&target.branch)));
        let response: ApiResponse<ApiRef> = self.send(self.request(Method::GET, url)?).await?;
        Ok(response.map(RefTarget::from))
    }

    async fn get_commit(
        &self,
        repo: &RepoId,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<CommitObject>> {
        let url = self.repo_url(repo, &format!("git/commits/{}", sha));
        let response: ApiResponse<ApiCommit> = self.send(self.request(Method::GET, url)?).await?;
        Ok(response.map(|c| CommitObject {
            sha: CommitSha::new(c.sha),
            tree: TreeSha::new(c.tree.sha),
            parents: c.parents.into_iter().map(|p| CommitSha::new(p.sha)).collect(),
            message: c.message,
            author: c.author.map(CommitAuthor::from),
        }))
    }

    async fn get_tree(
        &self,
        repo: &RepoId,
        sha: &TreeSha,
        recursive: bool,
    ) -> RemoteResult<ApiResponse<TreeListing>> {
        let url = self.repo_url(repo, &format!("git/trees/{}", sha));
        let mut builder = self.request(Method::GET, url)?;
        if recursive {
            builder = builder.query(&[("recursive", "1")]);
        }
        let response: ApiResponse<ApiTree> = self.send(builder).await?;
        Ok(response.map(|t| TreeListing {
            sha: TreeSha::new(t.sha),
            entries: t
                .tree
                .into_iter()
                .map(|e| TreeEntry {
                    path: e.path,
                    mode: e.mode,
                    kind: e.kind,
                    sha: e.sha,
                })
                .collect(),
            truncated: t.truncated,
        }))
    }

    async fn get_blob(&self, repo: &RepoId, sha: &BlobSha) -> RemoteResult<ApiResponse<BlobContent>> {
        let url = self.repo_url(repo, &format!("git/blobs/{}", sha));
        let response: ApiResponse<ApiBlob> = self.send(self.request(Method::GET, url)?).await?;
        let quota = response.quota;
        let blob = response.body;

        let content = match blob.encoding.as_str() {
            "base64" => {
                // the API wraps base64 payloads at 60 columns
                let cleaned: String = blob.content.chars().filter(|c| !c.is_whitespace()).collect();
                STANDARD
                    .decode(cleaned)
                    .map_err(|e| RemoteError::Decode(format!("blob {}: {}", blob.sha, e)))?
            }
            _ => blob.content.into_bytes(),
        };

        Ok(ApiResponse::with_quota(
            BlobContent {
                sha: BlobSha::new(blob.sha),
                content,
            },
            quota,
        ))
    }

    async fn create_blob(&self, repo: &RepoId, content: &[u8]) -> RemoteResult<ApiResponse<BlobSha>> {
        let url = self.repo_url(repo, "git/blobs");
        let body = CreateBlobBody {
            content: STANDARD.encode(content),
            encoding: "base64",
        };
        let response: ApiResponse<ApiSha> =
            self.send(self.request(Method::POST, url)?.json(&body)).await?;
        Ok(response.map(|s| BlobSha::new(s.sha)))
    }

    async fn create_tree(
        &self,
        repo: &RepoId,
        base_tree: &TreeSha,
        entries: &[NewTreeEntry],
    ) -> RemoteResult<ApiResponse<TreeSha>> {
        let url = self.repo_url(repo, "git/trees");
        let body = CreateTreeBody {
            base_tree: base_tree.as_str(),
            tree: entries
                .iter()
                .map(|e| CreateTreeEntry {
                    path: &e.path,
                    mode: e.mode.as_str(),
                    kind: "blob",
                    sha: e.sha.as_ref().map(|s| s.as_str()),
                })
                .collect(),
        };
        let response: ApiResponse<ApiSha> =
            self.send(self.request(Method::POST, url)?.json(&body)).await?;
        Ok(response.map(|s| TreeSha::new(s.sha)))
    }

    async fn create_commit(
        &self,
        repo: &RepoId,
        commit: &NewCommit,
    ) -> RemoteResult<ApiResponse<CommitSha>> {
        let url = self.repo_url(repo, "git/commits");
        let body = CreateCommitBody {
            message: &commit.message,
            tree: commit.tree.as_str(),
            parents: commit.parents.iter().map(|p| p.as_str()).collect(),
            author: commit.author.as_ref().map(|a| CreateCommitAuthor {
                name: &a.name,
                email: &a.email,
            }),
        };
        let response: ApiResponse<ApiSha> =
            self.send(self.request(Method::POST, url)?.json(&body)).await?;
        Ok(response.map(|s| CommitSha::new(s.sha)))
    }

    async fn update_ref(
        &self,
        repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
        force: bool,
    ) -> RemoteResult<ApiResponse<RefTarget>> {
        let url = self.repo_url(repo, &format!("git/refs/heads/{}", encode_branch(branch)));
        let body = UpdateRefBody {
            sha: sha.as_str(),
            force,
        };
        let response: ApiResponse<ApiRef> =
            self.send(self.request(Method::PATCH, url)?.json(&body)).await?;
        Ok(response.map(RefTarget::from))
    }

    async fn create_ref(
        &self,
        repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<RefTarget>> {
        let url = self.repo_url(repo, "git/refs");
        let body = CreateRefBody {
            ref_name: branch.as_ref_path(),
            sha: sha.as_str(),
        };
        let response: ApiResponse<ApiRef> =
            self.send(self.request(Method::POST, url)?.json(&body)).await?;
        Ok(response.map(RefTarget::from))
    }

    async fn compare(
        &self,
        repo: &RepoId,
        base: &CommitSha,
        head: &CommitSha,
    ) -> RemoteResult<ApiResponse<Comparison>> {
        let url = self.repo_url(repo, &format!("compare/{}...{}", base, head));
        let response: ApiResponse<ApiComparison> =
            self.send(self.request(Method::GET, url)?).await?;
        Ok(response.map(Comparison::from))
    }

    async fn create_pull_request(
        &self,
        repo: &RepoId,
        request: &NewPullRequest,
    ) -> RemoteResult<ApiResponse<PullRequest>> {
        let url = self.repo_url(repo, "pulls");
        self.send(self.request(Method::POST, url)?.json(request)).await
    }
}

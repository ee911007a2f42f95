use serde::Deserialize;

use crate::config::ProviderConfig;
use crate::error::Result;

use super::{
    CreatePrOptions, GitProvider, ListRepoOptions, PullRequest, RepoRef, get_json, post_json,
};

const USER_AGENT: &str = "ctrlscan";
const PER_PAGE: u32 = 100;
const MAX_PAGES: u32 = 10;

#[derive(Debug, Deserialize)]
struct GhOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    name: String,
    owner: GhOwner,
    clone_url: String,
    default_branch: Option<String>,
}

impl GhRepo {
    fn into_ref(self) -> RepoRef {
        RepoRef {
            provider: "github".to_string(),
            owner: self.owner.login,
            name: self.name,
            clone_url: self.clone_url,
            default_branch: self.default_branch.unwrap_or_else(|| "main".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: i64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct GhSearchRepos {
    items: Vec<GhRepo>,
}

#[derive(Debug, Deserialize)]
struct GhCodeItem {
    repository: GhRepo,
}

#[derive(Debug, Deserialize)]
struct GhSearchCode {
    items: Vec<GhCodeItem>,
}

#[derive(Debug)]
pub struct GitHubProvider {
    api_base: String,
    token: String,
}

impl GitHubProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
        }
    }

    fn get(&self, path: &str) -> ureq::Request {
        ureq::get(&format!("{}{path}", self.api_base))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "application/vnd.github+json")
            .set("User-Agent", USER_AGENT)
    }

    fn post(&self, path: &str) -> ureq::Request {
        ureq::post(&format!("{}{path}", self.api_base))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "application/vnd.github+json")
            .set("User-Agent", USER_AGENT)
    }
}

impl GitProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn auth_token(&self) -> &str {
        &self.token
    }

    fn list_repos(&self, opts: &ListRepoOptions) -> Result<Vec<RepoRef>> {
        let affiliation = if opts.all_accessible {
            "owner,collaborator,organization_member"
        } else {
            "owner"
        };
        let mut repos = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch: Vec<GhRepo> = get_json(|| {
                self.get("/user/repos")
                    .query("per_page", &PER_PAGE.to_string())
                    .query("page", &page.to_string())
                    .query("affiliation", affiliation)
            })?;
            let len = batch.len();
            repos.extend(batch.into_iter().map(GhRepo::into_ref));
            if len < PER_PAGE as usize {
                break;
            }
        }
        Ok(repos)
    }

    fn get_repo(&self, owner: &str, name: &str) -> Result<RepoRef> {
        let repo: GhRepo = get_json(|| self.get(&format!("/repos/{owner}/{name}")))?;
        Ok(repo.into_ref())
    }

    fn fork_repo(&self, owner: &str, name: &str) -> Result<RepoRef> {
        // Forking is asynchronous on GitHub's side; the response body carries
        // the fork's metadata immediately.
        let repo: GhRepo = post_json(
            || self.post(&format!("/repos/{owner}/{name}/forks")),
            serde_json::json!({}),
        )?;
        Ok(repo.into_ref())
    }

    fn create_pr(&self, opts: &CreatePrOptions) -> Result<PullRequest> {
        let body = serde_json::json!({
            "title": opts.title,
            "body": opts.body,
            "head": opts.head_branch,
            "base": opts.base_branch,
            "draft": opts.draft,
        });
        let pull: GhPull = post_json(
            || self.post(&format!("/repos/{}/{}/pulls", opts.owner, opts.repo)),
            body,
        )?;
        Ok(PullRequest {
            number: pull.number,
            url: pull.html_url,
        })
    }

    fn search_repos(&self, query: &str) -> Result<Vec<RepoRef>> {
        // Ecosystem queries carry a filename: qualifier and go through code
        // search; everything else is a plain repository search.
        if query.contains("filename:") {
            let result: GhSearchCode = get_json(|| {
                self.get("/search/code")
                    .query("q", query)
                    .query("per_page", &PER_PAGE.to_string())
            })?;
            let mut repos: Vec<RepoRef> = result
                .items
                .into_iter()
                .map(|i| i.repository.into_ref())
                .collect();
            repos.dedup_by(|a, b| a.owner == b.owner && a.name == b.name);
            Ok(repos)
        } else {
            let result: GhSearchRepos = get_json(|| {
                self.get("/search/repositories")
                    .query("q", query)
                    .query("per_page", &PER_PAGE.to_string())
            })?;
            Ok(result.items.into_iter().map(GhRepo::into_ref).collect())
        }
    }
}

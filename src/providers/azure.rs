use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

use super::{CreatePrOptions, GitProvider, ListRepoOptions, PullRequest, RepoRef, get_json, post_json};

const API_VERSION: &str = "7.0";

#[derive(Debug, Deserialize)]
struct AzProject {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzRepo {
    name: String,
    project: AzProject,
    remote_url: String,
    default_branch: Option<String>,
}

impl AzRepo {
    fn into_ref(self) -> RepoRef {
        // defaultBranch arrives fully qualified (refs/heads/main)
        let branch = self
            .default_branch
            .as_deref()
            .map(|b| b.trim_start_matches("refs/heads/").to_string())
            .unwrap_or_else(|| "main".to_string());
        RepoRef {
            provider: "azure".to_string(),
            owner: self.project.name,
            name: self.name,
            clone_url: self.remote_url,
            default_branch: branch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AzList {
    value: Vec<AzRepo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzPullRequest {
    pull_request_id: i64,
}

/// Azure DevOps adapter. The "owner" in a RepoRef is the project name under
/// the configured organization.
#[derive(Debug)]
pub struct AzureProvider {
    api_base: String,
    organization: String,
    token: String,
}

impl AzureProvider {
    pub fn new(cfg: &ProviderConfig) -> Result<Self> {
        let organization = cfg.organization.clone().ok_or_else(|| {
            Error::ConfigValidation("provider azure requires organization".to_string())
        })?;
        Ok(Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            organization,
            token: cfg.token.clone(),
        })
    }

    /// PATs go over Basic auth with an empty username.
    fn auth_header(&self) -> String {
        format!("Basic {}", BASE64.encode(format!(":{}", self.token)))
    }

    fn get(&self, path: &str) -> ureq::Request {
        ureq::get(&format!("{}/{}{path}", self.api_base, self.organization))
            .set("Authorization", &self.auth_header())
            .query("api-version", API_VERSION)
    }

    fn post(&self, path: &str) -> ureq::Request {
        ureq::post(&format!("{}/{}{path}", self.api_base, self.organization))
            .set("Authorization", &self.auth_header())
            .query("api-version", API_VERSION)
    }

    fn web_pr_url(&self, project: &str, repo: &str, id: i64) -> String {
        format!(
            "{}/{}/{project}/_git/{repo}/pullrequest/{id}",
            self.api_base, self.organization
        )
    }
}

impl GitProvider for AzureProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn auth_token(&self) -> &str {
        &self.token
    }

    fn list_repos(&self, _opts: &ListRepoOptions) -> Result<Vec<RepoRef>> {
        let list: AzList = get_json(|| self.get("/_apis/git/repositories"))?;
        Ok(list.value.into_iter().map(AzRepo::into_ref).collect())
    }

    fn get_repo(&self, owner: &str, name: &str) -> Result<RepoRef> {
        let repo: AzRepo =
            get_json(|| self.get(&format!("/{owner}/_apis/git/repositories/{name}")))?;
        Ok(repo.into_ref())
    }

    fn fork_repo(&self, _owner: &str, _name: &str) -> Result<RepoRef> {
        // Azure forks need a target project id; the direct-branch PR path
        // covers this provider instead.
        Err(Error::Provider(
            "azure: fork not supported, falling back to direct branch".to_string(),
        ))
    }

    fn create_pr(&self, opts: &CreatePrOptions) -> Result<PullRequest> {
        let body = serde_json::json!({
            "sourceRefName": format!("refs/heads/{}", opts.head_branch),
            "targetRefName": format!("refs/heads/{}", opts.base_branch),
            "title": opts.title,
            "description": opts.body,
            "isDraft": opts.draft,
        });
        let pr: AzPullRequest = post_json(
            || {
                self.post(&format!(
                    "/{}/_apis/git/repositories/{}/pullrequests",
                    opts.owner, opts.repo
                ))
            },
            body,
        )?;
        Ok(PullRequest {
            number: pr.pull_request_id,
            url: self.web_pr_url(&opts.owner, &opts.repo, pr.pull_request_id),
        })
    }

    fn search_repos(&self, query: &str) -> Result<Vec<RepoRef>> {
        // No code search API on this surface; filter the repo listing.
        let term = query
            .split_whitespace()
            .find(|part| !part.contains(':'))
            .unwrap_or(query)
            .trim_matches('"')
            .to_lowercase();
        let all = self.list_repos(&ListRepoOptions::default())?;
        Ok(all
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&term))
            .collect())
    }
}

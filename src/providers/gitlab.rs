use serde::Deserialize;

use crate::config::ProviderConfig;
use crate::error::Result;

use super::{CreatePrOptions, GitProvider, ListRepoOptions, PullRequest, RepoRef, get_json, post_json};

const PER_PAGE: u32 = 100;
const MAX_PAGES: u32 = 10;

#[derive(Debug, Deserialize)]
struct GlNamespace {
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    path: String,
    namespace: GlNamespace,
    http_url_to_repo: String,
    default_branch: Option<String>,
}

impl GlProject {
    fn into_ref(self) -> RepoRef {
        RepoRef {
            provider: "gitlab".to_string(),
            owner: self.namespace.full_path,
            name: self.path,
            clone_url: self.http_url_to_repo,
            default_branch: self.default_branch.unwrap_or_else(|| "main".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GlMergeRequest {
    iid: i64,
    web_url: String,
}

#[derive(Debug)]
pub struct GitLabProvider {
    api_base: String,
    token: String,
}

impl GitLabProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
        }
    }

    fn get(&self, path: &str) -> ureq::Request {
        ureq::get(&format!("{}{path}", self.api_base)).set("PRIVATE-TOKEN", &self.token)
    }

    fn post(&self, path: &str) -> ureq::Request {
        ureq::post(&format!("{}{path}", self.api_base)).set("PRIVATE-TOKEN", &self.token)
    }

    /// GitLab addresses projects by URL-encoded `namespace/path`.
    fn project_id(owner: &str, name: &str) -> String {
        format!("{owner}/{name}").replace('/', "%2F")
    }
}

impl GitProvider for GitLabProvider {
    fn name(&self) -> &str {
        "gitlab"
    }

    fn auth_token(&self) -> &str {
        &self.token
    }

    fn list_repos(&self, opts: &ListRepoOptions) -> Result<Vec<RepoRef>> {
        let mut repos = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch: Vec<GlProject> = get_json(|| {
                let mut request = self
                    .get("/projects")
                    .query("per_page", &PER_PAGE.to_string())
                    .query("page", &page.to_string())
                    .query("membership", "true");
                if !opts.all_accessible {
                    request = request.query("owned", "true");
                }
                request
            })?;
            let len = batch.len();
            repos.extend(batch.into_iter().map(GlProject::into_ref));
            if len < PER_PAGE as usize {
                break;
            }
        }
        Ok(repos)
    }

    fn get_repo(&self, owner: &str, name: &str) -> Result<RepoRef> {
        let project: GlProject =
            get_json(|| self.get(&format!("/projects/{}", Self::project_id(owner, name))))?;
        Ok(project.into_ref())
    }

    fn fork_repo(&self, owner: &str, name: &str) -> Result<RepoRef> {
        let project: GlProject = post_json(
            || self.post(&format!("/projects/{}/fork", Self::project_id(owner, name))),
            serde_json::json!({}),
        )?;
        Ok(project.into_ref())
    }

    fn create_pr(&self, opts: &CreatePrOptions) -> Result<PullRequest> {
        // Draft MRs are expressed through the title prefix.
        let title = if opts.draft {
            format!("Draft: {}", opts.title)
        } else {
            opts.title.clone()
        };
        let body = serde_json::json!({
            "source_branch": opts.head_branch,
            "target_branch": opts.base_branch,
            "title": title,
            "description": opts.body,
        });
        let mr: GlMergeRequest = post_json(
            || {
                self.post(&format!(
                    "/projects/{}/merge_requests",
                    Self::project_id(&opts.owner, &opts.repo)
                ))
            },
            body,
        )?;
        Ok(PullRequest {
            number: mr.iid,
            url: mr.web_url,
        })
    }

    fn search_repos(&self, query: &str) -> Result<Vec<RepoRef>> {
        // GitLab has no cross-project code search here; strip qualifiers and
        // search project names.
        let term = query
            .split_whitespace()
            .find(|part| !part.contains(':'))
            .unwrap_or(query)
            .trim_matches('"');
        let projects: Vec<GlProject> = get_json(|| {
            self.get("/projects")
                .query("search", term)
                .query("per_page", &PER_PAGE.to_string())
        })?;
        Ok(projects.into_iter().map(GlProject::into_ref).collect())
    }
}

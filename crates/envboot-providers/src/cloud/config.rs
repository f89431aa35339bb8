use crate::cloud::{CloudError, CloudResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectScope {
    Id(String),
    Name(String),
}

/// Keystone password credentials, as exported by an OpenRC file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project: ProjectScope,
    pub user_domain_name: String,
    pub project_domain_name: String,
    pub region_name: Option<String>,
    pub interface: String,
}

impl CloudConfig {
    pub fn from_env() -> CloudResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> CloudResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| missing(key));

        let auth_url = required("OS_AUTH_URL")?;
        let username = required("OS_USERNAME")?;
        let password = required("OS_PASSWORD")?;
        let project = match (get("OS_PROJECT_ID"), get("OS_PROJECT_NAME")) {
            (Some(id), _) => ProjectScope::Id(id),
            (None, Some(name)) => ProjectScope::Name(name),
            (None, None) => return Err(missing("OS_PROJECT_ID or OS_PROJECT_NAME")),
        };

        Ok(Self {
            auth_url,
            username,
            password,
            project,
            user_domain_name: get("OS_USER_DOMAIN_NAME").unwrap_or_else(|| "Default".to_string()),
            project_domain_name: get("OS_PROJECT_DOMAIN_NAME")
                .unwrap_or_else(|| "Default".to_string()),
            region_name: get("OS_REGION_NAME"),
            interface: get("OS_INTERFACE").unwrap_or_else(|| "public".to_string()),
        })
    }

    /// Token endpoint, tolerating auth URLs with or without the `/v3` suffix.
    pub fn token_url(&self) -> String {
        let base = self.auth_url.trim_end_matches('/');
        if base.ends_with("/v3") {
            format!("{base}/auth/tokens")
        } else {
            format!("{base}/v3/auth/tokens")
        }
    }
}

fn missing(key: &str) -> CloudError {
    CloudError::Config(format!(
        "Missing required OpenStack environment variable: {key}. \
         Hint: source your OpenRC or set OS_* variables."
    ))
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use url::Url;

/// Per-host robots.txt oracle.
///
/// robots.txt is fetched at most once per `scheme://host` for the process
/// lifetime; concurrent misses on the same host coalesce behind a per-host
/// lock. Anything other than a parseable 200 is treated as allow-all.
pub struct RobotsOracle {
    client: reqwest::Client,
    user_agent: String,
    cache: RwLock<HashMap<String, Arc<RobotsRules>>>,
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for RobotsOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotsOracle").finish_non_exhaustive()
    }
}

impl RobotsOracle {
    pub fn new(user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        RobotsOracle {
            client,
            user_agent: user_agent.to_string(),
            cache: RwLock::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether the configured user agent may fetch `url`.
    pub async fn is_allowed(&self, url: &str) -> bool {
        let (origin, path) = match Url::parse(url) {
            Ok(u) => match u.host_str() {
                Some(host) => (
                    format!("{}://{}", u.scheme(), host),
                    u.path().to_string(),
                ),
                None => return true,
            },
            Err(_) => return true,
        };

        if let Some(rules) = self.cache.read().await.get(&origin) {
            return rules.is_allowed(&path, &self.user_agent);
        }

        // Serialize the fetch per host so one miss fetches once.
        let lock = {
            let mut locks = self.fetch_locks.lock().await;
            locks
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(rules) = self.cache.read().await.get(&origin) {
            return rules.is_allowed(&path, &self.user_agent);
        }

        let rules = Arc::new(self.fetch_rules(&origin).await);
        self.cache
            .write()
            .await
            .insert(origin, rules.clone());

        rules.is_allowed(&path, &self.user_agent)
    }

    async fn fetch_rules(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{origin}/robots.txt");
        match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                RobotsRules::from_content(&body)
            }
            Ok(resp) => {
                // 404 and friends: everything is allowed.
                tracing::debug!(url = %robots_url, status = resp.status().as_u16(), "robots.txt unavailable, allowing all");
                RobotsRules::allow_all()
            }
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "robots.txt fetch failed, allowing all");
                RobotsRules::allow_all()
            }
        }
    }

    /// Number of hosts currently cached.
    pub async fn cached_hosts(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Parsed robots.txt rules: lowercase user-agent to disallowed path prefixes.
#[derive(Debug, Default)]
pub struct RobotsRules {
    rules: HashMap<String, Vec<String>>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        RobotsRules::default()
    }

    pub fn from_content(content: &str) -> Self {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut current_agents: Vec<String> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            let line = match line.find('#') {
                Some(idx) => line[..idx].trim(),
                None => line,
            };

            if line.is_empty() {
                current_agents.clear();
                continue;
            }

            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim();

                match key.as_str() {
                    "user-agent" => {
                        current_agents.push(value.to_lowercase());
                    }
                    "disallow" => {
                        for agent in &current_agents {
                            rules
                                .entry(agent.clone())
                                .or_default()
                                .push(value.to_string());
                        }
                    }
                    _ => {
                        // Allow, Sitemap, Crawl-delay: not used for blocking.
                    }
                }
            }
        }

        RobotsRules { rules }
    }

    /// Specific user-agent rules are checked first, then the wildcard group.
    /// An empty `Disallow:` value allows everything in its group.
    pub fn is_allowed(&self, path: &str, user_agent: &str) -> bool {
        let ua_lower = user_agent.to_lowercase();
        for agent in [ua_lower.as_str(), "*"] {
            if let Some(disallowed) = self.rules.get(agent) {
                for pattern in disallowed {
                    if pattern.is_empty() {
                        continue;
                    }
                    if path.starts_with(pattern.as_str()) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ROBOTS: &str = r#"
User-agent: *
Disallow: /admin/
Disallow: /private/

User-agent: WebExtractBot
Disallow: /internal

# comment line
User-agent: OtherBot
Disallow: /
"#;

    #[test]
    fn test_wildcard_rules() {
        let rules = RobotsRules::from_content(SAMPLE_ROBOTS);
        assert!(!rules.is_allowed("/admin/page", "anybot"));
        assert!(!rules.is_allowed("/private/data", "anybot"));
        assert!(rules.is_allowed("/public", "anybot"));
    }

    #[test]
    fn test_specific_agent_and_wildcard_inherited() {
        let rules = RobotsRules::from_content(SAMPLE_ROBOTS);
        assert!(!rules.is_allowed("/internal", "WebExtractBot"));
        // Wildcard group still applies to the specific agent.
        assert!(!rules.is_allowed("/admin/", "WebExtractBot"));
        assert!(rules.is_allowed("/blog", "WebExtractBot"));
    }

    #[test]
    fn test_full_disallow() {
        let rules = RobotsRules::from_content(SAMPLE_ROBOTS);
        assert!(!rules.is_allowed("/", "OtherBot"));
        assert!(!rules.is_allowed("/anything", "OtherBot"));
    }

    #[test]
    fn test_empty_disallow_allows_all() {
        let rules = RobotsRules::from_content("User-agent: *\nDisallow:\n");
        assert!(rules.is_allowed("/anything", "bot"));
    }

    #[test]
    fn test_empty_content_allows_all() {
        let rules = RobotsRules::from_content("");
        assert!(rules.is_allowed("/x", "bot"));
    }

    #[test]
    fn test_case_insensitive_agents() {
        let rules = RobotsRules::from_content("User-agent: WebExtractBot\nDisallow: /x\n");
        assert!(!rules.is_allowed("/x", "webextractbot"));
        assert!(!rules.is_allowed("/x/deep", "WEBEXTRACTBOT"));
    }

    #[tokio::test]
    async fn test_unparseable_url_allowed() {
        let oracle = RobotsOracle::new("WebExtractBot/1.0");
        assert!(oracle.is_allowed("not a url").await);
        assert_eq!(oracle.cached_hosts().await, 0);
    }
}

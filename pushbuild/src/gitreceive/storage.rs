use super::sha::GitSha;

/// Every object storage location a single build touches.
///
/// The `push` location is where the runtime side fetcher reads the finished artifact from, so the slug builder is told
/// to upload there through the `slug` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocations {
    pub tar_key: String,
    pub tar_url: String,
    pub push_key: String,
    pub push_url: String,
    pub slug_key: String,
    pub slug_url: String,
}

fn url(endpoint: &str, key: &str) -> String {
    format!("{}/git/{key}", endpoint.trim_end_matches('/'))
}

impl StorageLocations {
    pub fn new(endpoint: &str, app: &str, slug_name: &str, sha: &GitSha) -> Self {
        let tar_key = format!("home/{slug_name}/tar");
        let push_key = format!("home/{app}:git-{}/push", sha.short());
        let slug_key = format!("home/{app}:git-{}/slug", sha.short());

        Self {
            tar_url: url(endpoint, &tar_key),
            push_url: url(endpoint, &push_key),
            slug_url: url(endpoint, &slug_key),
            tar_key,
            push_key,
            slug_key,
        }
    }
}

use super::{sha::GitSha, storage::StorageLocations};
use crate::{conf, scheduler};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};
use strum::Display;

pub const SLUG_BUILD_PREFIX: &str = "slugbuild";
pub const DOCKER_BUILD_PREFIX: &str = "dockerbuild";

/// Where registry credentials show up inside the builder container.
pub const REGISTRY_SECRET_MOUNT_PATH: &str = "/var/run/secrets/registry";

pub const TAR_URL_ENV: &str = "TAR_URL";
pub const PUT_URL_ENV: &str = "put_url";
pub const BUILDPACK_URL_ENV: &str = "BUILDPACK_URL";
pub const IMG_NAME_ENV: &str = "IMG_NAME";
pub const DEBUG_ENV: &str = "DEBUG";

const NAME_SUFFIX_LEN: usize = 8;

/// Which kind of build the caller asked for. Resolved into a [`BuildStrategy`] by the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Slug { buildpack_url: Option<String> },
    /// Without an override the image is named after the app and commit, see [`BuildJobComposer::image_name`].
    Docker { image_name: Option<String> },
}

/// The build a job performs. A job is exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum BuildStrategy {
    /// Runs a buildpack over the source and uploads the resulting slug to `put_url`.
    #[strum(serialize = "slug")]
    Slug {
        put_url: String,
        buildpack_url: Option<String>,
    },
    /// Builds the repository's Dockerfile and pushes the result as `image_name`.
    #[strum(serialize = "docker")]
    Docker { image_name: String },
}

/// A complete description of one build job, ready to be handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJobSpec {
    pub name: String,
    pub namespace: String,
    pub app: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub secret_volumes: Vec<scheduler::SecretVolume>,
    pub pull_auth: Option<scheduler::RegistryAuth>,
    pub always_pull: bool,
    pub strategy: BuildStrategy,
}

impl From<BuildJobSpec> for scheduler::StartContainerRequest {
    fn from(spec: BuildJobSpec) -> Self {
        let labels = HashMap::from([
            ("pushbuild.app".to_string(), spec.app),
            ("pushbuild.strategy".to_string(), spec.strategy.to_string()),
        ]);

        Self {
            id: spec.name,
            namespace: spec.namespace,
            image: spec.image,
            variables: spec.env.into_iter().collect(),
            registry_auth: spec.pull_auth,
            always_pull: spec.always_pull,
            entrypoint: None,
            command: None,
            labels,
            secret_volumes: spec.secret_volumes,
        }
    }
}

/// Returns a job name unique across rapid repeated pushes of the same commit.
///
/// The suffix hashes the app, commit, current time and a random number; the scheduler treats names as unique keys so
/// a force-push followed by a retry must not reuse a name.
pub fn job_name(prefix: &str, app: &str, sha: &GitSha) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or_default();
    let salt: u64 = rand::thread_rng().gen();

    let mut hasher = Sha256::new();
    hasher.update(app.as_bytes());
    hasher.update(sha.full().as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(salt.to_le_bytes());
    let digest = hasher.finalize();

    let suffix: String = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(NAME_SUFFIX_LEN)
        .collect();

    format!("{prefix}-{app}-{}-{suffix}", sha.short())
}

#[derive(Debug, Clone)]
pub struct BuildJobComposer {
    namespace: String,
    debug: bool,
    slug_builder_image: String,
    docker_builder_image: String,
    registry: String,
    registry_secret: Option<String>,
    pull_auth: Option<scheduler::RegistryAuth>,
    always_pull: bool,
}

impl BuildJobComposer {
    pub fn new(config: &conf::Build) -> Self {
        Self {
            namespace: config.namespace.clone(),
            debug: config.debug,
            slug_builder_image: config.slug_builder_image.clone(),
            docker_builder_image: config.docker_builder_image.clone(),
            registry: config.registry.clone(),
            registry_secret: Some(config.registry_secret.clone()).filter(|name| !name.is_empty()),
            pull_auth: config
                .pull_auth
                .as_ref()
                .map(|auth| scheduler::RegistryAuth {
                    user: auth.user.clone(),
                    pass: auth.pass.clone(),
                }),
            always_pull: config.always_pull,
        }
    }

    /// The image docker builds of `app` at `sha` are pushed as.
    pub fn image_name(&self, app: &str, sha: &GitSha) -> String {
        let image = format!("{app}:git-{}", sha.short());

        if self.registry.is_empty() {
            return image;
        }

        format!("{}/{image}", self.registry.trim_end_matches('/'))
    }

    pub fn compose(
        &self,
        strategy: Strategy,
        app: &str,
        sha: &GitSha,
        env: &BTreeMap<String, String>,
        locations: &StorageLocations,
    ) -> BuildJobSpec {
        let (prefix, image, strategy) = match strategy {
            Strategy::Slug { buildpack_url } => (
                SLUG_BUILD_PREFIX,
                self.slug_builder_image.clone(),
                BuildStrategy::Slug {
                    put_url: locations.slug_url.clone(),
                    buildpack_url,
                },
            ),
            Strategy::Docker { image_name } => (
                DOCKER_BUILD_PREFIX,
                self.docker_builder_image.clone(),
                BuildStrategy::Docker {
                    image_name: image_name.unwrap_or_else(|| self.image_name(app, sha)),
                },
            ),
        };

        // Application config goes in first so it can never override the locations the builder reads and writes.
        let mut job_env = env.clone();
        job_env.insert(TAR_URL_ENV.into(), locations.tar_url.clone());
        job_env.insert(
            DEBUG_ENV.into(),
            if self.debug { "1" } else { "0" }.to_string(),
        );

        match &strategy {
            BuildStrategy::Slug {
                put_url,
                buildpack_url,
            } => {
                job_env.insert(PUT_URL_ENV.into(), put_url.clone());
                if let Some(buildpack_url) = buildpack_url {
                    job_env.insert(BUILDPACK_URL_ENV.into(), buildpack_url.clone());
                }
            }
            BuildStrategy::Docker { image_name } => {
                job_env.insert(IMG_NAME_ENV.into(), image_name.clone());
            }
        }

        let secret_volumes = self
            .registry_secret
            .iter()
            .map(|secret| scheduler::SecretVolume {
                secret: secret.clone(),
                mount_path: REGISTRY_SECRET_MOUNT_PATH.to_string(),
            })
            .collect();

        BuildJobSpec {
            name: job_name(prefix, app, sha),
            namespace: self.namespace.clone(),
            app: app.to_string(),
            image,
            env: job_env,
            secret_volumes,
            pull_auth: self.pull_auth.clone(),
            always_pull: self.always_pull,
            strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const ENDPOINT: &str = "http://127.0.0.1:3000";

    fn sha() -> GitSha {
        GitSha::new("12345678deadbeefdeadbeefdeadbeefdeadbeef").unwrap()
    }

    fn composer(debug: bool, registry_secret: &str) -> BuildJobComposer {
        BuildJobComposer::new(&conf::Build {
            namespace: "default".into(),
            debug,
            slug_builder_image: "slugbuilder:test".into(),
            docker_builder_image: "dockerbuilder:test".into(),
            registry: "registry.local:5000".into(),
            registry_secret: registry_secret.into(),
            always_pull: false,
            pull_auth: None,
            timeout: 60,
            poll_interval: 1,
            log_tail_lines: 20,
        })
    }

    fn app_env(with_values: bool) -> BTreeMap<String, String> {
        if with_values {
            BTreeMap::from([("KEY".to_string(), "VALUE".to_string())])
        } else {
            BTreeMap::new()
        }
    }

    #[test]
    fn job_names_carry_prefix_app_and_short_sha() {
        assert!(job_name(SLUG_BUILD_PREFIX, "demo", &sha()).starts_with("slugbuild-demo-12345678-"));
        assert!(
            job_name(DOCKER_BUILD_PREFIX, "demo", &sha()).starts_with("dockerbuild-demo-12345678-")
        );
    }

    #[test]
    fn repeated_builds_of_one_commit_get_distinct_names() {
        let names: std::collections::HashSet<_> = (0..100)
            .map(|_| job_name(SLUG_BUILD_PREFIX, "demo", &sha()))
            .collect();
        assert_eq!(names.len(), 100);
    }

    #[rstest]
    #[case::debug_auth_empty_env(true, "registry-creds", false, None)]
    #[case::debug_no_auth_empty_env(true, "", false, None)]
    #[case::auth_with_env(false, "registry-creds", true, None)]
    #[case::no_auth_with_env(false, "", true, None)]
    #[case::auth_buildpack(true, "registry-creds", false, Some("https://example.com/buildpack.git"))]
    #[case::no_auth_buildpack(false, "", true, Some("https://example.com/buildpack.git"))]
    fn slug_build_jobs(
        #[case] debug: bool,
        #[case] registry_secret: &str,
        #[case] with_env: bool,
        #[case] buildpack_url: Option<&str>,
    ) {
        let locations = StorageLocations::new(ENDPOINT, "demo", "demo", &sha());
        let spec = composer(debug, registry_secret).compose(
            Strategy::Slug {
                buildpack_url: buildpack_url.map(String::from),
            },
            "demo",
            &sha(),
            &app_env(with_env),
            &locations,
        );

        assert!(spec.name.starts_with("slugbuild-demo-12345678-"));
        assert_eq!(spec.namespace, "default");
        assert_eq!(spec.image, "slugbuilder:test");
        assert_eq!(
            spec.env.get(TAR_URL_ENV).unwrap(),
            "http://127.0.0.1:3000/git/home/demo/tar"
        );
        assert_eq!(
            spec.env.get(PUT_URL_ENV).unwrap(),
            "http://127.0.0.1:3000/git/home/demo:git-12345678/slug"
        );
        assert_eq!(
            spec.env.get(DEBUG_ENV).unwrap(),
            if debug { "1" } else { "0" }
        );
        assert_eq!(spec.env.get(BUILDPACK_URL_ENV).map(String::as_str), buildpack_url);
        assert_eq!(spec.env.get("KEY").is_some(), with_env);
        assert!(spec.env.get(IMG_NAME_ENV).is_none());
    }

    #[test]
    fn job_names_are_valid_container_names() {
        let app = crate::git::clean_repo_name("'/demo.v2.git'").unwrap();

        for prefix in [SLUG_BUILD_PREFIX, DOCKER_BUILD_PREFIX] {
            let name = job_name(prefix, &app, &sha());
            assert!(
                lazy_regex::regex_is_match!(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$", &name),
                "{name} is not a valid container name"
            );
        }
    }

    #[rstest]
    #[case::auth_empty_env("registry-creds", false, None, "registry.local:5000/demo:git-12345678")]
    #[case::no_auth_empty_env("", false, None, "registry.local:5000/demo:git-12345678")]
    #[case::auth_with_env("registry-creds", true, None, "registry.local:5000/demo:git-12345678")]
    #[case::no_auth_with_env("", true, None, "registry.local:5000/demo:git-12345678")]
    #[case::auth_img("registry-creds", false, Some("img"), "img")]
    #[case::no_auth_img_with_env("", true, Some("registry.other/demo:v2"), "registry.other/demo:v2")]
    fn docker_build_jobs(
        #[case] registry_secret: &str,
        #[case] with_env: bool,
        #[case] image_override: Option<&str>,
        #[case] expected_image: &str,
    ) {
        let locations = StorageLocations::new(ENDPOINT, "demo", "demo", &sha());
        let spec = composer(true, registry_secret).compose(
            Strategy::Docker {
                image_name: image_override.map(String::from),
            },
            "demo",
            &sha(),
            &app_env(with_env),
            &locations,
        );

        assert!(spec.name.starts_with("dockerbuild-demo-12345678-"));
        assert_eq!(spec.image, "dockerbuilder:test");
        assert_eq!(spec.env.get(IMG_NAME_ENV).unwrap(), expected_image);
        assert_eq!(
            spec.env.get(TAR_URL_ENV).unwrap(),
            "http://127.0.0.1:3000/git/home/demo/tar"
        );
        assert!(spec.env.get(PUT_URL_ENV).is_none());
        assert!(spec.env.get(BUILDPACK_URL_ENV).is_none());
        assert_eq!(spec.env.get("KEY").is_some(), with_env);
        assert_eq!(
            spec.strategy,
            BuildStrategy::Docker {
                image_name: expected_image.into()
            }
        );
    }

    #[test]
    fn registry_credentials_are_mounted_not_injected() {
        let locations = StorageLocations::new(ENDPOINT, "demo", "demo", &sha());
        let spec = composer(false, "registry-creds").compose(
            Strategy::Docker { image_name: None },
            "demo",
            &sha(),
            &BTreeMap::new(),
            &locations,
        );

        assert_eq!(
            spec.secret_volumes,
            vec![scheduler::SecretVolume {
                secret: "registry-creds".into(),
                mount_path: REGISTRY_SECRET_MOUNT_PATH.into(),
            }]
        );
        assert!(spec.env.values().all(|value| !value.contains("registry-creds")));

        let spec = composer(false, "").compose(
            Strategy::Docker { image_name: None },
            "demo",
            &sha(),
            &BTreeMap::new(),
            &locations,
        );
        assert!(spec.secret_volumes.is_empty());
    }

    #[test]
    fn app_config_cannot_override_storage_locations() {
        let locations = StorageLocations::new(ENDPOINT, "demo", "demo", &sha());
        let env = BTreeMap::from([(TAR_URL_ENV.to_string(), "http://evil/tar".to_string())]);

        let spec = composer(false, "").compose(
            Strategy::Slug {
                buildpack_url: None,
            },
            "demo",
            &sha(),
            &env,
            &locations,
        );

        assert_eq!(spec.env.get(TAR_URL_ENV).unwrap(), &locations.tar_url);
    }

    #[test]
    fn start_request_keeps_job_identity() {
        let locations = StorageLocations::new(ENDPOINT, "demo", "demo", &sha());
        let spec = composer(false, "").compose(
            Strategy::Slug {
                buildpack_url: None,
            },
            "demo",
            &sha(),
            &BTreeMap::new(),
            &locations,
        );

        let request = scheduler::StartContainerRequest::from(spec.clone());

        assert_eq!(request.id, spec.name);
        assert_eq!(request.namespace, "default");
        assert_eq!(request.image, spec.image);
        assert_eq!(request.variables.len(), spec.env.len());
        assert_eq!(request.labels.get("pushbuild.strategy").unwrap(), "slug");
        assert_eq!(request.labels.get("pushbuild.app").unwrap(), "demo");
    }
}

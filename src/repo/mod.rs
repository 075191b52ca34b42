// Repository descriptor and the privileged-build policy.

mod env;
mod origin;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use env::EnvVars;
pub use origin::{Origin, classify};

/// Root under which repositories are checked out inside build containers.
pub const CHECKOUT_ROOT: &str = "/var/cache/drone/src";

/// Describes the repository a build runs for.
///
/// Constructed once per build from upstream metadata and not mutated while
/// the build runs. The effective privilege decision is never stored here;
/// call [`Repo::should_run_privileged`] at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Local path or remote URL / SSH spec.
    pub location: String,
    /// Path the source is checked out to inside the build container.
    pub working_dir: String,
    /// Owner opted into privileged builds.
    #[serde(default)]
    pub privileged: bool,
    /// Set only when the build was triggered by an external pull request.
    #[serde(default)]
    pub pull_request: Option<String>,
    /// Injected into the build as environment variables.
    #[serde(default)]
    pub params: EnvVars,
}

impl Repo {
    /// Create a descriptor with the default working directory for `location`.
    pub fn new(location: impl Into<String>) -> Self {
        let location = location.into();
        let working_dir = default_working_dir(&location);
        Self {
            location,
            working_dir,
            privileged: false,
            pull_request: None,
            params: EnvVars::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_pull_request(mut self, id: impl Into<String>) -> Self {
        self.pull_request = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: EnvVars) -> Self {
        self.params = params;
        self
    }

    pub fn classify_origin(&self) -> Origin {
        classify(&self.location)
    }

    pub fn is_remote(&self) -> bool {
        self.classify_origin() != Origin::Local
    }

    pub fn is_git(&self) -> bool {
        self.classify_origin() == Origin::RemoteGit
    }

    /// The pull-request id, if the build came from one. Empty ids count as
    /// absent; whitespace-only ids do not.
    pub fn pull_request_id(&self) -> Option<&str> {
        self.pull_request.as_deref().filter(|id| !id.is_empty())
    }

    /// Whether the build container may receive elevated host privileges.
    ///
    /// True only when the owner opted in and the build did not come from a
    /// pull request. A pull request always wins over the opt-in.
    pub fn should_run_privileged(&self) -> bool {
        self.privileged && self.pull_request_id().is_none()
    }
}

/// Default checkout path for `location` inside the build container.
pub fn default_working_dir(location: &str) -> String {
    let tail = match classify(location) {
        Origin::Local => Path::new(location.trim())
            .file_name()
            .map(|name| name.to_string_lossy().to_string()),
        Origin::RemoteGit | Origin::RemoteOther => origin::host_path(location),
    };
    match tail {
        Some(tail) => format!("{CHECKOUT_ROOT}/{tail}"),
        None => CHECKOUT_ROOT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(privileged: bool, pr: Option<&str>) -> Repo {
        let mut repo = Repo::new("https://github.com/drone/drone").with_privileged(privileged);
        repo.pull_request = pr.map(String::from);
        repo
    }

    #[test]
    fn privileged_without_pull_request() {
        assert!(repo(true, None).should_run_privileged());
        assert!(repo(true, Some("")).should_run_privileged());
    }

    #[test]
    fn pull_request_overrides_opt_in() {
        assert!(!repo(true, Some("foo")).should_run_privileged());
        assert!(!repo(true, Some("some-dangerous-pr")).should_run_privileged());
        assert!(!repo(true, Some(" ")).should_run_privileged());
    }

    #[test]
    fn opt_out_is_never_privileged() {
        assert!(!repo(false, None).should_run_privileged());
        assert!(!repo(false, Some("foo")).should_run_privileged());
    }

    #[test]
    fn decision_follows_retriggered_descriptor() {
        let push = repo(true, None);
        let pr = push.clone().with_pull_request("42");
        assert!(push.should_run_privileged());
        assert!(!pr.should_run_privileged());
    }

    #[test]
    fn remote_and_git_agree_for_git_transports() {
        for location in [
            "git://github.com/foo/far",
            "git@github.com:foo/far.git",
            "https://github.com/foo/far.git",
            "ssh://baz.com/foo/far.git",
        ] {
            let repo = Repo::new(location);
            assert!(repo.is_remote(), "{location}");
            assert!(repo.is_git(), "{location}");
        }
    }

    #[test]
    fn local_paths_are_neither_remote_nor_git() {
        for location in ["/var/lib/src", "/home/ubuntu/src", "src"] {
            let repo = Repo::new(location);
            assert!(!repo.is_remote(), "{location}");
            assert!(!repo.is_git(), "{location}");
        }
    }

    #[test]
    fn svn_is_remote_but_not_git() {
        let repo = Repo::new("svn://gcc.gnu.org/svn/gcc/branches/gccgo");
        assert!(repo.is_remote());
        assert!(!repo.is_git());
    }

    #[test]
    fn default_working_dir_uses_host_path() {
        assert_eq!(
            Repo::new("git@github.com:drone/drone.git").working_dir,
            "/var/cache/drone/src/github.com/drone/drone"
        );
        assert_eq!(
            Repo::new("/home/ubuntu/project").working_dir,
            "/var/cache/drone/src/project"
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let repo: Repo = serde_yaml::from_str(
            "location: /src\nworking_dir: /build\nparams:\n  TOKEN: abc\n",
        )
        .unwrap();
        assert!(!repo.privileged);
        assert_eq!(repo.pull_request, None);
        assert_eq!(repo.params.get("TOKEN"), Some("abc"));
    }
}

/// Where a repository's source comes from. Decides how an external fetcher
/// obtains the checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    RemoteGit,
    RemoteOther,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::RemoteGit => "remote-git",
            Origin::RemoteOther => "remote-other",
        }
    }
}

/// Classify a repository location.
///
/// Git transports: `git://`, `ssh://`, `git@host:path` and `http(s)://host/path`,
/// each with an optional `.git` suffix. Anything else carrying a URL scheme is
/// `RemoteOther`; a bare filesystem path is `Local`.
pub fn classify(location: &str) -> Origin {
    let location = location.trim();

    if let Some(rest) = location.strip_prefix("git://") {
        return git_if(has_host(rest));
    }
    if let Some(rest) = location.strip_prefix("ssh://") {
        return git_if(has_host(rest));
    }
    if let Some(rest) = location.strip_prefix("git@") {
        return git_if(is_scp_like(rest));
    }
    if let Some(rest) = location
        .strip_prefix("https://")
        .or_else(|| location.strip_prefix("http://"))
    {
        return git_if(has_host_and_path(rest));
    }

    if scheme(location).is_some() {
        Origin::RemoteOther
    } else {
        Origin::Local
    }
}

fn git_if(matched: bool) -> Origin {
    if matched {
        Origin::RemoteGit
    } else {
        Origin::RemoteOther
    }
}

fn has_host(rest: &str) -> bool {
    rest.split('/').next().is_some_and(|host| !host.is_empty())
}

fn has_host_and_path(rest: &str) -> bool {
    match rest.split_once('/') {
        Some((host, path)) => !host.is_empty() && !path.trim_matches('/').is_empty(),
        None => false,
    }
}

/// `host:path` as used after `git@`.
fn is_scp_like(rest: &str) -> bool {
    match rest.split_once(':') {
        Some((host, path)) => !host.is_empty() && !host.contains('/') && !path.is_empty(),
        None => false,
    }
}

/// Returns the URL scheme of `location`, if it has one.
fn scheme(location: &str) -> Option<&str> {
    let (scheme, _) = location.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Strip the transport from a remote location, leaving `host/path` without a
/// user prefix or `.git` suffix. Used to derive default working directories.
pub(crate) fn host_path(location: &str) -> Option<String> {
    let location = location.trim();
    let rest = match location.split_once("://") {
        Some((_, rest)) => rest.to_string(),
        None => {
            let rest = location.strip_prefix("git@")?;
            rest.replacen(':', "/", 1)
        }
    };
    let rest = match rest.split_once('@') {
        Some((user, host)) if !user.contains('/') => host.to_string(),
        _ => rest,
    };
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    (!rest.is_empty()).then(|| rest.to_string())
}

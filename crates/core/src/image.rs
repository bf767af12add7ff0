//! Container image reference helpers.
//!
//! Reference parsing follows the docker distribution rules closely enough
//! for the runner's needs: hostname detection, default registry and tag
//! expansion, and whitelist matching that ignores the tag.

const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub hostname: String,
    pub repository: String,
    pub tag: String,
}

/// Parses an image reference into hostname, repository and tag, applying
/// docker-hub defaults.
pub fn parse(image: &str) -> Reference {
    let image = image.trim();
    let (remainder, tag) = split_tag(image);
    let mut parts: Vec<&str> = remainder.splitn(2, '/').collect();

    // a leading segment is a hostname only when it contains a dot, a
    // colon, or is the literal localhost.
    let hostname = if parts.len() == 2
        && (parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost")
    {
        parts.remove(0).to_string()
    } else {
        DEFAULT_REGISTRY.to_string()
    };

    let mut repository = parts.join("/");
    if hostname == DEFAULT_REGISTRY && !repository.contains('/') {
        repository = format!("library/{repository}");
    }

    Reference {
        hostname,
        repository,
        tag: if tag.is_empty() {
            "latest".to_string()
        } else {
            tag.to_string()
        },
    }
}

fn split_tag(image: &str) -> (&str, &str) {
    // the tag separator is the last colon after the last slash; a colon
    // before a slash belongs to a registry port.
    match image.rfind(':') {
        Some(idx) if image[idx..].find('/').is_none() => (&image[..idx], &image[idx + 1..]),
        _ => (image, ""),
    }
}

/// Expands a shorthand reference to its canonical form.
pub fn expand(image: &str) -> String {
    let r = parse(image);
    format!("{}/{}:{}", r.hostname, r.repository, r.tag)
}

/// Reports whether the image is untagged or tagged :latest.
pub fn is_latest(image: &str) -> bool {
    parse(image).tag == "latest"
}

/// Reports whether two references point at the same repository,
/// ignoring the tag. Used for the privileged-image whitelist.
pub fn match_repository(a: &str, b: &str) -> bool {
    let a = parse(a);
    let b = parse(b);
    a.hostname == b.hostname && a.repository == b.repository
}

/// Reports whether the image is hosted on the given registry address.
/// The address may carry a scheme or a trailing path.
pub fn match_hostname(image: &str, address: &str) -> bool {
    let hostname = parse(image).hostname;
    let address = address
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let address = address.split('/').next().unwrap_or_default();
    if address == "index.docker.io" || address == "registry.hub.docker.com" {
        return hostname == DEFAULT_REGISTRY;
    }
    hostname == address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand() {
        assert_eq!(expand("golang"), "docker.io/library/golang:latest");
        assert_eq!(expand("golang:1.21"), "docker.io/library/golang:1.21");
        assert_eq!(
            expand("plugins/docker"),
            "docker.io/plugins/docker:latest"
        );
        assert_eq!(
            expand("gcr.io/project/image:v1"),
            "gcr.io/project/image:v1"
        );
        assert_eq!(
            expand("localhost:5000/app"),
            "localhost:5000/app:latest"
        );
    }

    #[test]
    fn test_is_latest() {
        assert!(is_latest("alpine"));
        assert!(is_latest("alpine:latest"));
        assert!(!is_latest("alpine:3.19"));
    }

    #[test]
    fn test_match_repository_ignores_tag() {
        assert!(match_repository("plugins/docker", "plugins/docker:18"));
        assert!(match_repository("plugins/docker:1", "docker.io/plugins/docker:2"));
        assert!(!match_repository("plugins/docker", "plugins/ecr"));
    }

    #[test]
    fn test_match_hostname() {
        assert!(match_hostname("gcr.io/project/app", "gcr.io"));
        assert!(match_hostname("gcr.io/project/app", "https://gcr.io"));
        assert!(match_hostname("app", "https://index.docker.io/v1/"));
        assert!(!match_hostname("gcr.io/project/app", "docker.io"));
    }
}

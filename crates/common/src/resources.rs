//! Content-addressed resources
//!
//! Every uploaded asset is identified by the SHA-256 of its content. Build
//! assets are hashed once per run; each snapshot adds one root resource
//! holding its serialized DOM.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::types::Resource;

/// Extensions never uploaded as build resources
const SKIPPED_EXTENSIONS: &[&str] = &["html", "htm", "js", "mjs", "cjs", "map"];

/// A file of a built catalog, relative to its root
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

/// Compute SHA-256 hash of data
pub fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn is_skipped(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SKIPPED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn resource_url(path: &Path) -> String {
    let segments: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => {
                Some(urlencoding::encode(&part.to_string_lossy()).into_owned())
            }
            _ => None,
        })
        .collect();
    format!("/{}", segments.join("/"))
}

/// Turn build assets into uploadable resources
///
/// Documents, scripts and source maps are dropped; the preview document is
/// uploaded per snapshot instead.
pub fn make_resources(assets: &[Asset]) -> Vec<Resource> {
    assets
        .iter()
        .filter(|asset| !is_skipped(&asset.path))
        .map(|asset| Resource {
            resource_url: resource_url(&asset.path),
            sha: hash(&asset.content),
            mimetype: mime_guess::from_path(&asset.path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            content: asset.content.clone(),
            is_root: false,
        })
        .collect()
}

/// Lower-case, dash separated form of a snapshot name
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// The serialized document of one snapshot
pub fn make_root_resource(name: &str, html: &str, query_params: &str) -> Resource {
    let mut resource_url = format!("/{}.html", slugify(name));
    if !query_params.is_empty() {
        resource_url.push('?');
        resource_url.push_str(query_params);
    }
    Resource {
        resource_url,
        sha: hash(html.as_bytes()),
        content: html.as_bytes().to_vec(),
        mimetype: "text/html".to_string(),
        is_root: true,
    }
}

/// Resources whose sha the server reported missing, each sha once
pub fn missing_resources<'a, I>(missing: Option<&[String]>, resources: I) -> Vec<&'a Resource>
where
    I: IntoIterator<Item = &'a Resource>,
{
    let Some(missing) = missing.filter(|m| !m.is_empty()) else {
        return Vec::new();
    };
    let missing: HashSet<&str> = missing.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    resources
        .into_iter()
        .filter(|&r| missing.contains(r.sha.as_str()) && seen.insert(r.sha.as_str()))
        .collect()
}

/// Load every file under a built catalog directory
///
/// Symlinks are followed; a link looping back to an ancestor is skipped.
pub fn collect_assets(root: &Path) -> Result<Vec<Asset>> {
    let mut assets = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.loop_ancestor().is_some() => {
                warn!("skipping symlink loop at {}", e.path().unwrap_or(root).display());
                continue;
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        assets.push(Asset {
            content: std::fs::read(entry.path())?,
            path,
        });
    }
    debug!("collected {} assets from {}", assets.len(), root.display());
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(path: &str, content: &str) -> Asset {
        Asset {
            path: PathBuf::from(path),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_hash_known_value() {
        assert_eq!(
            hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_documents_scripts_and_maps_are_dropped() {
        let resources = make_resources(&[
            asset("main.js", "console.log(1)"),
            asset("main.map", "{}"),
            asset("index.html", "<html></html>"),
            asset("styles.css", "body {}"),
        ]);

        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].resource_url, "/styles.css");
        assert_eq!(resources[0].mimetype, "text/css");
        assert_eq!(resources[0].sha, hash(b"body {}"));
        assert!(!resources[0].is_root);
    }

    #[test]
    fn test_nested_paths_are_encoded() {
        let resources = make_resources(&[asset("static/media/logo mark.svg", "<svg/>")]);
        assert_eq!(resources[0].resource_url, "/static/media/logo%20mark.svg");
        assert_eq!(resources[0].mimetype, "image/svg+xml");
    }

    #[test]
    fn test_root_resource() {
        let root =
            make_root_resource("Button: Primary [RTL]", "<html></html>", "id=button--primary");
        assert_eq!(root.resource_url, "/button-primary-rtl.html?id=button--primary");
        assert_eq!(root.mimetype, "text/html");
        assert!(root.is_root);

        let bare = make_root_resource("Button: Primary", "<html></html>", "");
        assert_eq!(bare.resource_url, "/button-primary.html");
    }

    #[test]
    fn test_missing_resources() {
        let resources = make_resources(&[
            asset("a.css", "a"),
            asset("copy/a.css", "a"),
            asset("b.css", "b"),
        ]);
        let missing = vec![hash(b"a"), hash(b"zzz")];

        let first = missing_resources(Some(missing.as_slice()), &resources);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].resource_url, "/a.css");
        assert_eq!(first, missing_resources(Some(missing.as_slice()), &resources));

        assert!(missing_resources(None, &resources).is_empty());
        assert!(missing_resources(Some(&[][..]), &resources).is_empty());
    }

    #[test]
    fn test_collect_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("static")).unwrap();
        std::fs::write(dir.path().join("iframe.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("static/app.css"), "body {}").unwrap();

        let assets = collect_assets(dir.path()).unwrap();
        let paths: Vec<_> = assets.iter().map(|a| a.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("iframe.html"), PathBuf::from("static/app.css")]);

        let resources = make_resources(&assets);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].resource_url, "/static/app.css");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("static")).unwrap();
        std::fs::write(dir.path().join("static/app.css"), "body {}").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("static/root")).unwrap();

        let assets = collect_assets(dir.path()).unwrap();
        let paths: Vec<_> = assets.iter().map(|a| a.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("static/app.css")]);
    }
}

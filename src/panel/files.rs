//! Server file operations.
//!
//! Paths are percent-encoded per segment before they are spliced into the
//! request URL, so names with spaces or reserved characters round-trip
//! through the panel unmangled. Content reads prefer the modern
//! `file/{path}` route and fall back to the legacy `files/contents`
//! endpoint on panels that predate it.

use serde::Deserialize;
use tracing::debug;

use super::error::PanelError;
use super::{http, PanelApi};

const JAR_SUFFIX: &str = ".jar";

/// One entry in a server directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Older panels report this as `is_dir`
    #[serde(default, alias = "is_dir")]
    pub directory: bool,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    #[serde(default)]
    files: Vec<FileEntry>,
}

/// Percent-encodes each path segment, keeping `/` as the separator.
///
/// Empty segments collapse, so `//a//b/` and `a/b` address the same file.
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl PanelApi {
    /// Lists a directory on a server.
    pub async fn list_path(
        &self,
        server_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, PanelError> {
        let base = self.credentials.get()?.base_url;
        let url = format!(
            "{}/api/servers/{}/files/list",
            base,
            urlencoding::encode(server_id)
        );

        let response = self
            .tokens
            .send_authorized(|| self.http.get(url.as_str()).query(&[("path", path)]))
            .await?;
        let response = http::check_status(response).await?;
        let parsed: FileListResponse = response.json().await?;
        Ok(parsed.files)
    }

    /// Reads a file's contents.
    pub async fn fetch_file(&self, server_id: &str, path: &str) -> Result<String, PanelError> {
        let base = self.credentials.get()?.base_url;
        let url = format!(
            "{}/api/servers/{}/file/{}",
            base,
            urlencoding::encode(server_id),
            encode_path(path)
        );

        let response = self
            .tokens
            .send_authorized(|| self.http.get(url.as_str()))
            .await?;
        match http::check_status(response).await {
            Ok(response) => Ok(response.text().await?),
            Err(e) if e.is_not_found() => {
                debug!(path = %path, "Modern file route missing, trying legacy endpoint");
                self.fetch_file_legacy(&base, server_id, path).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_file_legacy(
        &self,
        base: &str,
        server_id: &str,
        path: &str,
    ) -> Result<String, PanelError> {
        let url = format!(
            "{}/api/servers/{}/files/contents",
            base,
            urlencoding::encode(server_id)
        );

        let response = self
            .tokens
            .send_authorized(|| self.http.get(url.as_str()).query(&[("path", path)]))
            .await?;
        let response = http::check_status(response).await?;
        Ok(response.text().await?)
    }

    /// Writes a file's contents, creating the file if it does not exist.
    pub async fn put_file(
        &self,
        server_id: &str,
        path: &str,
        contents: &str,
    ) -> Result<(), PanelError> {
        let base = self.credentials.get()?.base_url;
        let url = format!(
            "{}/api/servers/{}/file/{}",
            base,
            urlencoding::encode(server_id),
            encode_path(path)
        );

        let body = contents.to_string();
        let response = self
            .tokens
            .send_authorized(|| self.http.put(url.as_str()).body(body.clone()))
            .await?;
        http::check_status(response).await?;
        Ok(())
    }

    /// Deletes a file on a server.
    pub async fn delete_file(&self, server_id: &str, path: &str) -> Result<(), PanelError> {
        let base = self.credentials.get()?.base_url;
        let url = format!(
            "{}/api/servers/{}/file/{}",
            base,
            urlencoding::encode(server_id),
            encode_path(path)
        );

        let response = self
            .tokens
            .send_authorized(|| self.http.delete(url.as_str()))
            .await?;
        http::check_status(response).await?;
        Ok(())
    }

    /// Lists `.jar` files in the server's mod directory, sorted by name.
    ///
    /// Servers running plugin loaders expose `plugins/` instead of `mods/`;
    /// a missing `mods/` falls through to it.
    pub async fn list_jar_files(&self, server_id: &str) -> Result<Vec<String>, PanelError> {
        let entries = match self.list_path(server_id, "mods").await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                debug!(server_id = %server_id, "No mods directory, trying plugins");
                self.list_path(server_id, "plugins").await?
            }
            Err(e) => return Err(e),
        };

        let mut jars: Vec<String> = entries
            .into_iter()
            .filter(|entry| !entry.directory && entry.name.ends_with(JAR_SUFFIX))
            .map(|entry| entry.name)
            .collect();
        jars.sort();
        Ok(jars)
    }
}

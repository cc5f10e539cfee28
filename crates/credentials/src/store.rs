//! Store and refresher abstractions plus secure file helpers
//!
//! Both traits return boxed futures so managers can hold them as
//! `Arc<dyn CredentialStore>` / `Arc<dyn TokenRefresher>`.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::constants::{CREDENTIAL_DIR_MODE, CREDENTIAL_FILE_MODE};
use crate::error::{Error, Result};
use crate::record::TokenCredentials;

/// Boxed, sendable future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence for one provider's credential file.
pub trait CredentialStore: Send + Sync {
    /// Location of the backing file, for logging.
    fn path(&self) -> &Path;

    /// Parse the file into a normalized record.
    ///
    /// Fails on insecure permissions, schema errors, or a missing refresh
    /// token. A missing file is `Error::NotFound` unless the provider
    /// supports bootstrap, in which case an empty record is returned.
    fn load(&self) -> BoxFuture<'_, Result<TokenCredentials>>;

    /// Write the record back in the provider's schema, owner read/write only.
    fn save<'a>(&'a self, creds: &'a TokenCredentials) -> BoxFuture<'a, Result<()>>;
}

/// Refresh-token exchange against a provider's token endpoint.
pub trait TokenRefresher: Send + Sync {
    /// Exchange `refresh_token` for a fresh record.
    ///
    /// The returned record keeps `refresh_token` when the endpoint does not
    /// rotate it.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenCredentials>>;
}

/// Read a credential file after checking it is not group/world accessible.
pub(crate) async fn read_secure(path: &Path) -> Result<Vec<u8>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(Error::Io(format!("stat {}: {e}", path.display()))),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(Error::InsecurePermissions(format!(
                "{} has mode {mode:o}, expected {CREDENTIAL_FILE_MODE:o}",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    tokio::fs::read(path)
        .await
        .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))
}

/// Write a credential file atomically.
///
/// Creates missing parent directories as 0700, writes a 0600 temp file in the
/// same directory, then renames it over the target so a crash mid-write never
/// leaves a truncated credential file behind.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    if !dir.as_os_str().is_empty() {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(CREDENTIAL_DIR_MODE);
        builder
            .create(dir)
            .await
            .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("credentials");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(CREDENTIAL_FILE_MODE);

    let mut file = options
        .open(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp credential file: {e}")))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp credential file: {e}")))?;
    drop(file);

    // The temp file may predate this process with a looser mode.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(
            &tmp_path,
            std::fs::Permissions::from_mode(CREDENTIAL_FILE_MODE),
        )
        .await
        .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

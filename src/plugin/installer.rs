//! Catalog installation
//!
//! Installs and uninstalls remote catalog packages. `install` returns an
//! [`InstallJob`], a lazily driven stream of [`InstallStep`]s that always ends
//! in exactly one of `Success` or `Error`:
//!
//! - script packages: `Downloading -> Success | Error`
//! - native packages (zip with `manifest.json`):
//!   `Downloading -> Installing -> Success | Error`
//!
//! Downloads go to `{temp_dir}/{package}-{uuid}.part` and only reach the
//! install directory by rename after the whole body arrived and its checksum
//! matched. Cancelling or dropping the job removes the partial file.

use super::types::{derive_source_id, SourceId, SourceMetadata, UserSource};
use crate::core::config::{CatalogConfig, HttpConfig};
use crate::core::error::{Result, TingError};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SCRIPTS_DIR: &str = "scripts";
const NATIVE_DIR: &str = "native";
const NATIVE_MANIFEST: &str = "manifest.json";

/// Package as advertised by a remote catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRemote {
    pub source_id: SourceId,
    pub package_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub download_url: String,
    pub is_script_package: bool,
    pub name: String,
    pub lang: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Expected SHA-256 of the download, hex encoded
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub metadata: SourceMetadata,
}

impl CatalogRemote {
    /// Remote entry for a script source, with its id derived from its identity
    pub fn script(
        package_name: impl Into<String>,
        name: impl Into<String>,
        lang: impl Into<String>,
        base_url: impl Into<String>,
        download_url: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let lang = lang.into();
        let base_url = base_url.into();
        Self {
            source_id: derive_source_id(&name, &lang, &base_url),
            package_name: package_name.into(),
            version_name: "1.0.0".to_string(),
            version_code: 1,
            download_url: download_url.into(),
            is_script_package: true,
            name,
            lang,
            base_url: Some(base_url),
            sha256: None,
            metadata: SourceMetadata::default(),
        }
    }
}

/// Manifest written next to an installed artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledCatalog {
    #[serde(flatten)]
    pub remote: CatalogRemote,
    /// Epoch millis
    pub installed_at: i64,
    /// Script file or native package directory
    pub artifact: PathBuf,
}

impl InstalledCatalog {
    /// Script source defined by this catalog
    pub fn user_source(&self) -> Result<UserSource> {
        if !self.remote.is_script_package {
            return Err(TingError::InstallError(format!(
                "{} is not a script package",
                self.remote.package_name
            )));
        }
        let base_url = self.remote.base_url.clone().ok_or_else(|| {
            TingError::InstallError(format!("{} has no base URL", self.remote.package_name))
        })?;
        let script = fs::read_to_string(&self.artifact)?;

        let mut metadata = self.remote.metadata.clone();
        if metadata.version.is_empty() {
            metadata.version = self.remote.version_name.clone();
        }
        let mut source = UserSource::new(&self.remote.name, &self.remote.lang, base_url, script, metadata);
        source.id = self.remote.source_id;
        Ok(source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    Idle,
    Downloading,
    Installing,
    Success,
    Error(String),
}

impl InstallStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallStep::Success | InstallStep::Error(_))
    }
}

/// Reacts to catalogs being installed or removed
///
/// Hooks own per-source state (loaded engines, health entries, rate buckets,
/// filter selections) and purge it on uninstall.
#[async_trait]
pub trait CatalogLifecycleHook: Send + Sync {
    async fn on_installed(&self, _catalog: &InstalledCatalog) -> Result<()> {
        Ok(())
    }

    async fn on_uninstalled(&self, _catalog: &InstalledCatalog) -> Result<()> {
        Ok(())
    }
}

/// Running installation
///
/// Nothing happens until the stream is polled. Dropping the job cancels it.
pub struct InstallJob {
    steps: BoxStream<'static, InstallStep>,
    cancel: CancellationToken,
}

impl InstallJob {
    /// Abort the installation; the stream ends with `Error`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job, for handing to another task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for InstallJob {
    type Item = InstallStep;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.steps.poll_next_unpin(cx)
    }
}

impl Drop for InstallJob {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// File or directory removed on drop unless kept
struct PathGuard {
    path: PathBuf,
    armed: bool,
}

impl PathGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = remove_path(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to clean up {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// `{name}.backup` next to the target
fn backup_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    target.with_file_name(name)
}

/// Installation backup for rollback support
struct InstallationBackup {
    /// Path being installed to
    target_path: PathBuf,
    /// Backup path (if target existed before)
    backup_path: Option<PathBuf>,
    /// Whether the installation was committed
    committed: bool,
}

impl InstallationBackup {
    fn new(target_path: &Path) -> Result<Self> {
        let backup_path = if target_path.exists() {
            let backup = backup_path_for(target_path);
            debug!("Creating backup: {} -> {}", target_path.display(), backup.display());

            if backup.exists() {
                remove_path(&backup)?;
            }
            fs::rename(target_path, &backup)?;
            Some(backup)
        } else {
            None
        };

        Ok(Self {
            target_path: target_path.to_path_buf(),
            backup_path,
            committed: false,
        })
    }

    /// Commit the installation (delete backup)
    fn commit(mut self) -> Result<()> {
        self.committed = true;
        if let Some(backup) = &self.backup_path {
            debug!("Committing installation, removing backup: {}", backup.display());
            remove_path(backup)?;
        }
        Ok(())
    }

    /// Rollback the installation (restore backup)
    fn rollback(&self) -> Result<()> {
        warn!("Rolling back installation: {}", self.target_path.display());

        if self.target_path.exists() {
            remove_path(&self.target_path)?;
        }
        if let Some(backup) = &self.backup_path {
            debug!("Restoring backup: {} -> {}", backup.display(), self.target_path.display());
            fs::rename(backup, &self.target_path)?;
        }
        Ok(())
    }
}

impl Drop for InstallationBackup {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.rollback() {
                error!("Failed to rollback installation: {}", e);
            }
        }
    }
}

static PACKAGE_NAME: OnceLock<Option<Regex>> = OnceLock::new();

/// Package names become file names, so only a safe subset is accepted
fn validate_package_name(name: &str) -> Result<()> {
    let pattern = PACKAGE_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").ok())
        .as_ref()
        .ok_or_else(|| TingError::InstallError("Invalid package name pattern".to_string()))?;
    if pattern.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(TingError::InstallError(format!("Invalid package name: {:?}", name)))
    }
}

struct InstallerInner {
    install_dir: PathBuf,
    temp_dir: PathBuf,
    client: reqwest::Client,
    read_timeout: std::time::Duration,
    hooks: RwLock<Vec<Arc<dyn CatalogLifecycleHook>>>,
}

pub struct CatalogInstaller {
    inner: Arc<InstallerInner>,
}

impl CatalogInstaller {
    pub fn new(catalogs: &CatalogConfig, http: &HttpConfig) -> Result<Self> {
        fs::create_dir_all(catalogs.install_dir.join(SCRIPTS_DIR))?;
        fs::create_dir_all(catalogs.install_dir.join(NATIVE_DIR))?;
        fs::create_dir_all(&catalogs.temp_dir)?;

        let client = reqwest::Client::builder()
            .connect_timeout(http.connect_timeout())
            .user_agent(http.user_agent.clone())
            .build()?;

        Ok(Self {
            inner: Arc::new(InstallerInner {
                install_dir: catalogs.install_dir.clone(),
                temp_dir: catalogs.temp_dir.clone(),
                client,
                read_timeout: http.read_timeout(),
                hooks: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Register a hook run after installs and uninstalls, in order
    pub fn add_hook(&self, hook: Arc<dyn CatalogLifecycleHook>) {
        match self.inner.hooks.write() {
            Ok(mut hooks) => hooks.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }

    pub fn install(&self, target: CatalogRemote) -> InstallJob {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline {
            inner: self.inner.clone(),
            target,
            cancel: cancel.clone(),
            phase: Phase::Start,
        };

        InstallJob {
            steps: futures::stream::unfold(pipeline, Pipeline::advance).boxed(),
            cancel,
        }
    }

    /// Remove an installed package and purge per-source state through hooks
    pub async fn uninstall(&self, package_name: &str) -> InstallStep {
        let catalog = match self.installed(package_name) {
            Some(catalog) => catalog,
            None => return InstallStep::Error("package not found".to_string()),
        };

        let manifest = self.inner.manifest_path(&catalog.remote);
        if let Err(e) = remove_path(&catalog.artifact).and_then(|_| fs::remove_file(&manifest)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(package = package_name, "Failed to uninstall: {}", e);
                return InstallStep::Error(format!("Failed to remove {}: {}", package_name, e));
            }
            if let Err(e) = fs::remove_file(&manifest) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(package = package_name, "Failed to remove manifest: {}", e);
                }
            }
        }

        for hook in self.inner.hooks_snapshot() {
            if let Err(e) = hook.on_uninstalled(&catalog).await {
                warn!(package = package_name, "Uninstall hook failed: {}", e);
            }
        }

        info!(package = package_name, source_id = catalog.remote.source_id, "Catalog uninstalled");
        InstallStep::Success
    }

    /// Every installed catalog; unreadable manifests are skipped
    pub fn installed_catalogs(&self) -> Vec<InstalledCatalog> {
        let mut catalogs = Vec::new();
        for dir in [SCRIPTS_DIR, NATIVE_DIR] {
            let entries = match fs::read_dir(self.inner.install_dir.join(dir)) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cannot read catalog directory {}: {}", dir, e);
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_manifest(&path) {
                    Ok(catalog) => catalogs.push(catalog),
                    Err(e) => warn!("Skipping unreadable manifest {}: {}", path.display(), e),
                }
            }
        }
        catalogs.sort_by(|a, b| a.remote.package_name.cmp(&b.remote.package_name));
        catalogs
    }

    pub fn installed(&self, package_name: &str) -> Option<InstalledCatalog> {
        validate_package_name(package_name).ok()?;
        [SCRIPTS_DIR, NATIVE_DIR].iter().find_map(|dir| {
            let path = self
                .inner
                .install_dir
                .join(dir)
                .join(format!("{}.json", package_name));
            path.exists().then(|| read_manifest(&path).ok()).flatten()
        })
    }
}

fn read_manifest(path: &Path) -> Result<InstalledCatalog> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

impl InstallerInner {
    fn hooks_snapshot(&self) -> Vec<Arc<dyn CatalogLifecycleHook>> {
        match self.hooks.read() {
            Ok(hooks) => hooks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn kind_dir(&self, remote: &CatalogRemote) -> PathBuf {
        self.install_dir.join(if remote.is_script_package { SCRIPTS_DIR } else { NATIVE_DIR })
    }

    fn manifest_path(&self, remote: &CatalogRemote) -> PathBuf {
        self.kind_dir(remote).join(format!("{}.json", remote.package_name))
    }

    fn artifact_path(&self, remote: &CatalogRemote) -> PathBuf {
        let dir = self.kind_dir(remote);
        if remote.is_script_package {
            dir.join(format!("{}.js", remote.package_name))
        } else {
            dir.join(&remote.package_name)
        }
    }

    /// Stream the package to a partial file, verifying its checksum
    async fn download(&self, target: &CatalogRemote) -> Result<PathGuard> {
        let part = PathGuard::new(
            self.temp_dir
                .join(format!("{}-{}.part", target.package_name, Uuid::new_v4())),
        );
        let mut file = tokio::fs::File::create(part.path()).await?;

        debug!(package = %target.package_name, url = %target.download_url, "Downloading package");
        let response = tokio::time::timeout(self.read_timeout, self.client.get(&target.download_url).send())
            .await
            .map_err(|_| {
                TingError::InstallError(format!(
                    "Download stalled: no response within {}s",
                    self.read_timeout.as_secs()
                ))
            })?
            .map_err(|e| TingError::InstallError(format!("Download failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(TingError::InstallError(format!(
                "Download failed: HTTP {}",
                response.status().as_u16()
            )));
        }

        let mut hasher = Sha256::new();
        let mut body = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.read_timeout, body.next()).await {
                Ok(Some(chunk)) => {
                    chunk.map_err(|e| TingError::InstallError(format!("Download failed: {}", e)))?
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(TingError::InstallError(
                        "Download stalled: read timed out".to_string(),
                    ))
                }
            };
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = &target.sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(TingError::InstallError(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        Ok(part)
    }

    /// Move a downloaded script into place and write its manifest
    fn activate_script(&self, target: &CatalogRemote, part: PathGuard) -> Result<InstalledCatalog> {
        let bytes = fs::read(part.path())?;
        if std::str::from_utf8(&bytes).is_err() {
            return Err(TingError::InstallError("Script package is not valid UTF-8".to_string()));
        }

        let artifact = self.artifact_path(target);
        let backup = InstallationBackup::new(&artifact)?;
        move_into_place(part.keep(), &artifact)?;
        let catalog = self.write_manifest(target, artifact)?;
        backup.commit()?;
        Ok(catalog)
    }

    /// Extract a native package into staging, then swap it in
    ///
    /// Cancellation is honoured up to the swap; once the package is in place
    /// the install completes.
    fn activate_native(
        &self,
        target: &CatalogRemote,
        part: PathGuard,
        cancel: &CancellationToken,
    ) -> Result<InstalledCatalog> {
        let dir = self.kind_dir(target);
        let staging = PathGuard::new(dir.join(format!(".{}-{}.staging", target.package_name, Uuid::new_v4())));
        fs::create_dir_all(staging.path())?;
        extract_zip(part.path(), staging.path())?;

        let manifest = staging.path().join(NATIVE_MANIFEST);
        let text = fs::read_to_string(&manifest).map_err(|_| {
            TingError::InstallError(format!("Invalid package: missing {}", NATIVE_MANIFEST))
        })?;
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(_)) => {}
            _ => {
                return Err(TingError::InstallError(format!(
                    "Invalid package: {} is not a JSON object",
                    NATIVE_MANIFEST
                )))
            }
        }

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let artifact = self.artifact_path(target);
        let backup = InstallationBackup::new(&artifact)?;
        fs::rename(staging.path(), &artifact)?;
        staging.keep();
        let catalog = self.write_manifest(target, artifact)?;
        backup.commit()?;
        Ok(catalog)
    }

    fn write_manifest(&self, target: &CatalogRemote, artifact: PathBuf) -> Result<InstalledCatalog> {
        let catalog = InstalledCatalog {
            remote: target.clone(),
            installed_at: chrono::Utc::now().timestamp_millis(),
            artifact,
        };
        let path = self.manifest_path(target);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&catalog)?)?;
        fs::rename(&tmp, &path)?;
        Ok(catalog)
    }

    async fn notify_installed(&self, catalog: &InstalledCatalog) {
        for hook in self.hooks_snapshot() {
            if let Err(e) = hook.on_installed(catalog).await {
                warn!(package = %catalog.remote.package_name, "Install hook failed: {}", e);
            }
        }
    }
}

/// Rename, falling back to copy + rename when crossing filesystems
fn move_into_place(from: PathBuf, to: &Path) -> Result<()> {
    let from = PathGuard::new(from);
    if fs::rename(from.path(), to).is_ok() {
        from.keep();
        return Ok(());
    }

    let staged = PathGuard::new(to.with_extension("incoming"));
    fs::copy(from.path(), staged.path())?;
    fs::rename(staged.path(), to)?;
    staged.keep();
    Ok(())
}

/// Extract zip archive to target directory
fn extract_zip(source: &Path, target: &Path) -> Result<()> {
    let file = fs::File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| TingError::InstallError(format!("Invalid package: {}", e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| TingError::InstallError(format!("Invalid package entry: {}", e)))?;

        let outpath = match entry.enclosed_name() {
            Some(path) => target.join(path),
            None => continue,
        };

        if entry.name().ends_with('/') {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }
    }

    Ok(())
}

fn cancelled() -> TingError {
    TingError::InstallError("Installation cancelled".to_string())
}

enum Phase {
    Start,
    Download,
    Install(PathGuard),
    Done,
}

struct Pipeline {
    inner: Arc<InstallerInner>,
    target: CatalogRemote,
    cancel: CancellationToken,
    phase: Phase,
}

impl Pipeline {
    async fn advance(mut self) -> Option<(InstallStep, Self)> {
        let step = match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Start => match self.preflight() {
                Ok(()) => {
                    self.phase = Phase::Download;
                    InstallStep::Downloading
                }
                Err(e) => self.fail(e),
            },
            Phase::Download => match self.cancellable(self.inner.download(&self.target)).await {
                Ok(part) if self.target.is_script_package => {
                    let result = self.inner.activate_script(&self.target, part);
                    self.finish(result).await
                }
                Ok(part) => {
                    self.phase = Phase::Install(part);
                    InstallStep::Installing
                }
                Err(e) => self.fail(e),
            },
            Phase::Install(part) => {
                let inner = self.inner.clone();
                let target = self.target.clone();
                let cancel = self.cancel.clone();
                // The task checks the token itself; the step reports its real outcome
                let result = tokio::task::spawn_blocking(move || inner.activate_native(&target, part, &cancel))
                    .await
                    .map_err(|e| TingError::InstallError(format!("Install task failed: {}", e)))
                    .and_then(|result| result);
                self.finish(result).await
            }
            Phase::Done => return None,
        };

        Some((step, self))
    }

    fn preflight(&self) -> Result<()> {
        validate_package_name(&self.target.package_name)?;
        if self.target.is_script_package && self.target.base_url.is_none() {
            return Err(TingError::InstallError(
                "Script package is missing its base URL".to_string(),
            ));
        }
        Ok(())
    }

    async fn cancellable<T>(&self, work: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(cancelled()),
            result = work => result,
        }
    }

    async fn finish(&self, result: Result<InstalledCatalog>) -> InstallStep {
        match result {
            Ok(catalog) => {
                info!(
                    package = %catalog.remote.package_name,
                    version = %catalog.remote.version_name,
                    source_id = catalog.remote.source_id,
                    "Catalog installed"
                );
                self.inner.notify_installed(&catalog).await;
                InstallStep::Success
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, err: TingError) -> InstallStep {
        warn!(package = %self.target.package_name, "Installation failed: {}", err);
        let message = match err {
            TingError::InstallError(message) => message,
            other => other.to_string(),
        };
        InstallStep::Error(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::http_client::tests::test_config;
    use crate::test_support::{Reply, TestServer};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        installer: CatalogInstaller,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalogs = CatalogConfig {
            install_dir: dir.path().join("installed"),
            temp_dir: dir.path().join("tmp"),
        };
        let installer = CatalogInstaller::new(&catalogs, &test_config(&dir.path().join("cache"))).unwrap();
        Fixture { dir, installer }
    }

    impl Fixture {
        fn temp_files(&self) -> usize {
            fs::read_dir(self.dir.path().join("tmp")).unwrap().count()
        }
    }

    #[derive(Default)]
    struct CountingHook {
        installed: AtomicUsize,
        uninstalled: AtomicUsize,
    }

    #[async_trait]
    impl CatalogLifecycleHook for CountingHook {
        async fn on_installed(&self, _catalog: &InstalledCatalog) -> Result<()> {
            self.installed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_uninstalled(&self, _catalog: &InstalledCatalog) -> Result<()> {
            self.uninstalled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn script_target(url: String) -> CatalogRemote {
        CatalogRemote::script("demo.source", "Demo", "en", "https://demo.test", url)
    }

    fn zip_package(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, content) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_package_name_rules() {
        for name in ["demo.source", "a", "en.mangadex-2", "X_1"] {
            assert!(validate_package_name(name).is_ok(), "{}", name);
        }
        let too_long = "x".repeat(129);
        for name in ["", ".hidden", "a..b", "../escape", "a/b", "a b", too_long.as_str()] {
            assert!(validate_package_name(name).is_err(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_unreachable_download_then_uninstall() {
        let fx = fixture();
        let steps: Vec<_> = fx
            .installer
            .install(script_target("http://127.0.0.1:1/demo.js".to_string()))
            .collect()
            .await;

        assert_eq!(steps[0], InstallStep::Downloading);
        assert!(matches!(steps.last(), Some(InstallStep::Error(_))));
        assert_eq!(steps.iter().filter(|s| s.is_terminal()).count(), 1);
        assert_eq!(fx.temp_files(), 0);

        assert_eq!(
            fx.installer.uninstall("demo.source").await,
            InstallStep::Error("package not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_script_install_and_uninstall() {
        let server = TestServer::spawn(|_| Reply::ok("function getListings() { return []; }")).await;
        let fx = fixture();
        let hook = Arc::new(CountingHook::default());
        fx.installer.add_hook(hook.clone());

        let steps: Vec<_> = fx.installer.install(script_target(server.url("/demo.js"))).collect().await;
        assert_eq!(steps, vec![InstallStep::Downloading, InstallStep::Success]);
        assert_eq!(hook.installed.load(Ordering::SeqCst), 1);

        let catalog = fx.installer.installed("demo.source").unwrap();
        assert!(catalog.artifact.ends_with("scripts/demo.source.js"));
        let source = catalog.user_source().unwrap();
        assert_eq!(source.id, catalog.remote.source_id);
        assert!(source.script.contains("getListings"));
        assert_eq!(fx.installer.installed_catalogs().len(), 1);
        assert_eq!(fx.temp_files(), 0);

        assert_eq!(fx.installer.uninstall("demo.source").await, InstallStep::Success);
        assert_eq!(hook.uninstalled.load(Ordering::SeqCst), 1);
        assert!(!catalog.artifact.exists());
        assert!(fx.installer.installed("demo.source").is_none());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_installs_nothing() {
        let server = TestServer::spawn(|_| Reply::ok("function x() {}")).await;
        let fx = fixture();

        let mut target = script_target(server.url("/demo.js"));
        target.sha256 = Some("00".repeat(32));
        let steps: Vec<_> = fx.installer.install(target.clone()).collect().await;
        match steps.last() {
            Some(InstallStep::Error(message)) => assert!(message.contains("checksum")),
            other => panic!("unexpected final step {:?}", other),
        }
        assert!(fx.installer.installed("demo.source").is_none());
        assert_eq!(fx.temp_files(), 0);

        target.sha256 = Some(format!("{:x}", Sha256::digest(b"function x() {}")));
        let steps: Vec<_> = fx.installer.install(target).collect().await;
        assert_eq!(steps.last(), Some(&InstallStep::Success));
    }

    #[tokio::test]
    async fn test_http_error_and_invalid_name() {
        let server = TestServer::spawn(|_| Reply::status(404, "gone")).await;
        let fx = fixture();

        let steps: Vec<_> = fx.installer.install(script_target(server.url("/demo.js"))).collect().await;
        assert_eq!(steps.last(), Some(&InstallStep::Error("Download failed: HTTP 404".to_string())));

        let mut target = script_target(server.url("/demo.js"));
        target.package_name = "../escape".to_string();
        let steps: Vec<_> = fx.installer.install(target).collect().await;
        assert_eq!(steps.len(), 1);
        assert!(matches!(&steps[0], InstallStep::Error(m) if m.contains("Invalid package name")));
    }

    #[tokio::test]
    async fn test_native_package_install_and_reinstall() {
        let good = zip_package(&[(NATIVE_MANIFEST, r#"{"entry": "lib.so"}"#), ("lib.so", "v1")]);
        let server = TestServer::spawn(move |req| match req.path.as_str() {
            "/good.zip" => Reply::ok(good.clone()),
            "/no-manifest.zip" => Reply::ok(zip_package(&[("lib.so", "v2")])),
            _ => Reply::ok("not a zip"),
        })
        .await;
        let fx = fixture();

        let mut target = script_target(server.url("/good.zip"));
        target.is_script_package = false;
        target.package_name = "demo.native".to_string();

        let steps: Vec<_> = fx.installer.install(target.clone()).collect().await;
        assert_eq!(
            steps,
            vec![InstallStep::Downloading, InstallStep::Installing, InstallStep::Success]
        );
        let catalog = fx.installer.installed("demo.native").unwrap();
        assert_eq!(fs::read_to_string(catalog.artifact.join("lib.so")).unwrap(), "v1");
        assert!(catalog.user_source().is_err());

        // invalid packages fail in the install step and keep the old version
        for path in ["/no-manifest.zip", "/garbage"] {
            target.download_url = server.url(path);
            let steps: Vec<_> = fx.installer.install(target.clone()).collect().await;
            assert_eq!(steps[1], InstallStep::Installing);
            assert!(matches!(steps.last(), Some(InstallStep::Error(m)) if m.contains("Invalid package")));
            assert_eq!(fs::read_to_string(catalog.artifact.join("lib.so")).unwrap(), "v1");
        }

        target.download_url = server.url("/good.zip");
        let steps: Vec<_> = fx.installer.install(target).collect().await;
        assert_eq!(steps.last(), Some(&InstallStep::Success));
        assert!(!backup_path_for(&catalog.artifact).exists());

        assert_eq!(fx.installer.uninstall("demo.native").await, InstallStep::Success);
        assert!(!catalog.artifact.exists());
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_file() {
        let server = TestServer::spawn(|_| Reply::ok("slow").delayed(Duration::from_secs(5))).await;
        let fx = fixture();

        let mut job = fx.installer.install(script_target(server.url("/demo.js")));
        assert_eq!(job.next().await, Some(InstallStep::Downloading));

        let token = job.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let rest: Vec<_> = (&mut job).collect().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(rest, vec![InstallStep::Error("Installation cancelled".to_string())]);
        assert_eq!(fx.temp_files(), 0);
        assert!(fx.installer.installed("demo.source").is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_installing_keeps_previous_version() {
        let v1 = zip_package(&[(NATIVE_MANIFEST, "{}"), ("lib.so", "v1")]);
        let v2 = zip_package(&[(NATIVE_MANIFEST, "{}"), ("lib.so", "v2")]);
        let server = TestServer::spawn(move |req| match req.path.as_str() {
            "/v1.zip" => Reply::ok(v1.clone()),
            _ => Reply::ok(v2.clone()),
        })
        .await;
        let fx = fixture();
        let hook = Arc::new(CountingHook::default());
        fx.installer.add_hook(hook.clone());

        let mut target = script_target(server.url("/v2.zip"));
        target.is_script_package = false;
        target.package_name = "demo.native".to_string();

        let mut job = fx.installer.install(target.clone());
        assert_eq!(job.next().await, Some(InstallStep::Downloading));
        assert_eq!(job.next().await, Some(InstallStep::Installing));
        job.cancel();
        let rest: Vec<_> = (&mut job).collect().await;
        assert_eq!(rest, vec![InstallStep::Error("Installation cancelled".to_string())]);
        assert!(fx.installer.installed("demo.native").is_none());
        assert_eq!(hook.installed.load(Ordering::SeqCst), 0);

        target.download_url = server.url("/v1.zip");
        let steps: Vec<_> = fx.installer.install(target.clone()).collect().await;
        assert_eq!(steps.last(), Some(&InstallStep::Success));
        let artifact = fx.installer.installed("demo.native").unwrap().artifact;

        target.download_url = server.url("/v2.zip");
        let mut job = fx.installer.install(target);
        job.next().await;
        assert_eq!(job.next().await, Some(InstallStep::Installing));
        job.cancel();
        assert_eq!(
            job.next().await,
            Some(InstallStep::Error("Installation cancelled".to_string()))
        );
        assert_eq!(job.next().await, None);

        assert_eq!(fs::read_to_string(artifact.join("lib.so")).unwrap(), "v1");
        assert_eq!(hook.installed.load(Ordering::SeqCst), 1);
        let leftovers: Vec<_> = fs::read_dir(artifact.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(fx.temp_files(), 0);
    }

    #[tokio::test]
    async fn test_server_stalling_before_headers_times_out() {
        let server = TestServer::spawn(|_| Reply::ok("late").delayed(Duration::from_secs(8))).await;
        let fx = fixture();

        let started = std::time::Instant::now();
        let steps: Vec<_> = fx.installer.install(script_target(server.url("/demo.js"))).collect().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(steps.last(), Some(InstallStep::Error(m)) if m.contains("Download stalled")));
        assert_eq!(fx.temp_files(), 0);
        assert!(fx.installer.installed("demo.source").is_none());
    }

    #[tokio::test]
    async fn test_dropping_job_cleans_up() {
        let server = TestServer::spawn(|_| Reply::ok("slow").delayed(Duration::from_secs(5))).await;
        let fx = fixture();

        let mut job = fx.installer.install(script_target(server.url("/demo.js")));
        job.next().await;
        // poll the download long enough to create the partial file
        let _ = tokio::time::timeout(Duration::from_millis(200), job.next()).await;
        drop(job);

        assert_eq!(fx.temp_files(), 0);
    }
}

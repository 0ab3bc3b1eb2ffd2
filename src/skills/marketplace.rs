use crate::db::{
    Db, MarketplaceKind, MarketplaceRecord, PluginRecord, PluginStatus, SkillRecord,
    SkillSourceType,
};
use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parsed `.claude-plugin/plugin.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A plugin visible in a synced marketplace.
#[derive(Debug, Clone, Serialize)]
pub struct AvailablePlugin {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub keywords: Vec<String>,
}

/// Result of syncing a marketplace repository.
#[derive(Debug, Clone, Serialize)]
pub struct MarketplaceSync {
    pub plugins: Vec<AvailablePlugin>,
    /// True when the repo declares `.claude-plugin/marketplace.json`;
    /// false when the repo itself is a single plugin.
    pub is_marketplace: bool,
    pub marketplace_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RemovedArtifacts {
    pub skills: Vec<String>,
    pub commands: Vec<String>,
    pub agents: Vec<String>,
    pub hooks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MarketplaceManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: ManifestMetadata,
    #[serde(default)]
    owner: ManifestOwner,
    #[serde(default)]
    plugins: Vec<ManifestPlugin>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestMetadata {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestOwner {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestPlugin {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    author: Option<ManifestOwner>,
    /// Either a relative path string or `{ "source": "url", "url": ... }`.
    #[serde(default)]
    source: Option<serde_json::Value>,
    #[serde(default)]
    skills: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// PluginManager
// ---------------------------------------------------------------------------

/// Git-backed content marketplaces synchronized into on-disk caches and
/// installed into the shared content roots.
///
/// Cache layout: `{cache}/{owner}/{repo}/` holds a shallow clone. Installed
/// artifacts land in `~/.claude/{skills,commands,agents,hooks}/`.
pub struct PluginManager {
    db: Arc<Db>,
    cache_dir: PathBuf,
    skills_dir: PathBuf,
    commands_dir: PathBuf,
    agents_dir: PathBuf,
    hooks_dir: PathBuf,
    /// One in-flight sync per cache key.
    sync_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PluginManager {
    pub fn new(
        db: Arc<Db>,
        cache_dir: PathBuf,
        skills_dir: PathBuf,
        commands_dir: PathBuf,
        agents_dir: PathBuf,
        hooks_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            cache_dir,
            skills_dir,
            commands_dir,
            agents_dir,
            hooks_dir,
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_roots(db: Arc<Db>) -> Self {
        Self::new(
            db,
            crate::paths::plugin_cache_dir(),
            crate::paths::plugin_skills_dir(),
            crate::paths::plugin_commands_dir(),
            crate::paths::plugin_agents_dir(),
            crate::paths::plugin_hooks_dir(),
        )
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.cache_dir,
            &self.skills_dir,
            &self.commands_dir,
            &self.agents_dir,
            &self.hooks_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Cache key and directory for a marketplace: `{owner}/{repo}` when the
    /// URL parses as one, otherwise the sanitized marketplace name.
    pub fn marketplace_cache_dir(&self, marketplace: &MarketplaceRecord) -> PathBuf {
        if marketplace.kind == MarketplaceKind::Local {
            return PathBuf::from(&marketplace.url);
        }
        let key = owner_repo_from_url(&marketplace.url)
            .unwrap_or_else(|| crate::util::sanitize_folder_name(&marketplace.name));
        self.cache_dir.join(key)
    }

    async fn cache_lock(&self, cache_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().await;
        locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- sync ---------------------------------------------------------------

    /// Clone or fast-forward the marketplace source, then scan it for
    /// plugins. Updates the marketplace record's sync metadata.
    pub async fn sync(&self, marketplace: &MarketplaceRecord) -> ServiceResult<MarketplaceSync> {
        self.ensure_dirs()?;
        let cache = self.marketplace_cache_dir(marketplace);
        let lock = self.cache_lock(&cache.display().to_string()).await;
        let _guard = lock.lock().await;

        match marketplace.kind {
            MarketplaceKind::Git => self.sync_git(&marketplace.url, &marketplace.branch, &cache).await?,
            MarketplaceKind::Http => self.sync_http(&marketplace.url, &cache).await?,
            MarketplaceKind::Local => {
                if !cache.exists() {
                    return Err(ServiceError::not_found(format!(
                        "Local marketplace path does not exist: {}",
                        cache.display()
                    )));
                }
            }
        }

        let result = self.scan_cache(&cache, &marketplace.name);

        if self.db.get_marketplace(&marketplace.id)?.is_some() {
            let plugin_names: Vec<String> = result.plugins.iter().map(|p| p.name.clone()).collect();
            self.db.update_marketplace(&marketplace.id, |m| {
                m.last_synced_at = Some(crate::util::now_ts_nanos());
                m.cached_plugins = plugin_names.clone();
            })?;
        }

        Ok(result)
    }

    async fn sync_git(&self, url: &str, branch: &str, cache: &Path) -> ServiceResult<()> {
        let cache_path = cache.display().to_string();
        if cache.join(".git").exists() {
            info!("Fetching latest from {} branch {}", url, branch);
            let fetch =
                run_git(&["-C", cache_path.as_str(), "fetch", "origin", branch]).await?;
            if !fetch.success {
                warn!("Git fetch failed: {}", fetch.stderr);
            }
            let target = format!("origin/{branch}");
            let reset = run_git(&[
                "-C",
                cache_path.as_str(),
                "reset",
                "--hard",
                target.as_str(),
            ])
            .await?;
            if !reset.success {
                warn!("Git reset failed: {}", reset.stderr);
            }
        } else {
            info!("Cloning {} branch {}", url, branch);
            std::fs::create_dir_all(cache)?;
            let clone = run_git(&[
                "clone",
                "-b",
                branch,
                "--depth",
                "1",
                url,
                cache_path.as_str(),
            ])
            .await?;
            if !clone.success {
                return Err(ServiceError::backend(format!("Git clone failed: {}", clone.stderr.trim()))
                    .with_detail(clone.stderr));
            }
        }
        Ok(())
    }

    /// HTTP marketplaces point at a ZIP archive of the repository.
    async fn sync_http(&self, url: &str, cache: &Path) -> ServiceResult<()> {
        let client = http_client()?;
        let tmp = download_to_temp(&client, url).await?;
        let result = extract_archive_to_dir(&tmp, cache);
        let _ = std::fs::remove_file(&tmp);
        result
    }

    // -- scanning -----------------------------------------------------------

    fn scan_cache(&self, cache: &Path, fallback_name: &str) -> MarketplaceSync {
        let manifest_path = cache.join(".claude-plugin").join("marketplace.json");
        if manifest_path.exists() {
            let (plugins, name) = self.parse_marketplace_manifest(&manifest_path);
            info!(
                "Found marketplace '{}' with {} plugins",
                name.as_deref().unwrap_or("unknown"),
                plugins.len()
            );
            return MarketplaceSync {
                plugins,
                is_marketplace: true,
                marketplace_name: name,
            };
        }

        // No manifest: the repo may itself be a single plugin.
        if let Some(plugin) = self.detect_repo_as_plugin(cache) {
            info!("No marketplace.json found, treating repo as single plugin");
            return MarketplaceSync {
                plugins: vec![plugin],
                is_marketplace: false,
                marketplace_name: None,
            };
        }

        // Last resort: scan common subdirectories for plugin/skill folders.
        let plugins = self.scan_plugin_dirs(cache);
        info!("Found {} plugins in {}", plugins.len(), fallback_name);
        MarketplaceSync {
            is_marketplace: plugins.len() > 1,
            plugins,
            marketplace_name: None,
        }
    }

    fn parse_marketplace_manifest(&self, path: &Path) -> (Vec<AvailablePlugin>, Option<String>) {
        let manifest: MarketplaceManifest = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
        {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to parse marketplace.json {}: {}", path.display(), e);
                return (Vec::new(), None);
            }
        };

        let marketplace_base = path
            .parent()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let marketplace_version = manifest.metadata.version.clone().unwrap_or_else(|| "1.0.0".into());

        let mut plugins = Vec::new();
        for plugin in &manifest.plugins {
            if plugin.name.is_empty() {
                continue;
            }
            let mut skill_count = plugin
                .skills
                .iter()
                .filter(|s| s.is_string())
                .count();
            if skill_count == 0 {
                if let Some(source_dir) = local_source_dir(&plugin.source, &marketplace_base) {
                    skill_count = count_skill_dirs(&source_dir.join("skills"));
                }
            }
            plugins.push(AvailablePlugin {
                name: plugin.name.clone(),
                version: plugin.version.clone().unwrap_or_else(|| marketplace_version.clone()),
                description: plugin.description.clone(),
                author: plugin
                    .author
                    .as_ref()
                    .and_then(|a| a.name.clone())
                    .or_else(|| manifest.owner.name.clone())
                    .unwrap_or_default(),
                keywords: vec![format!("{skill_count} skills")],
            });
        }
        (plugins, manifest.name)
    }

    /// A repo with no marketplace manifest can still be one plugin:
    /// `.claude-plugin/plugin.json`, a `skills/` tree, or root markdown
    /// (standalone skill).
    fn detect_repo_as_plugin(&self, repo: &Path) -> Option<AvailablePlugin> {
        let plugin_json = repo.join(".claude-plugin").join("plugin.json");
        if plugin_json.exists() {
            match parse_plugin_json(&plugin_json) {
                Ok(manifest) => {
                    return Some(AvailablePlugin {
                        name: if manifest.name.is_empty() {
                            repo.file_name()?.to_string_lossy().to_string()
                        } else {
                            manifest.name
                        },
                        version: manifest.version.unwrap_or_else(|| "1.0.0".into()),
                        description: manifest.description,
                        author: manifest.author,
                        keywords: manifest.keywords,
                    })
                }
                Err(e) => warn!("Failed to parse plugin.json: {}", e),
            }
        }

        let skills_dir = repo.join("skills");
        let skill_count = count_skill_dirs(&skills_dir);
        if skill_count > 0 {
            let repo_name = repo.file_name()?.to_string_lossy().to_string();
            return Some(AvailablePlugin {
                name: repo_name,
                version: "1.0.0".into(),
                description: format!("Plugin with {skill_count} skills"),
                author: String::new(),
                keywords: vec![format!("{skill_count} skills")],
            });
        }

        detect_standalone_skill(repo)
    }

    fn scan_plugin_dirs(&self, cache: &Path) -> Vec<AvailablePlugin> {
        let mut plugins = Vec::new();
        let mut scan_dirs = vec![cache.to_path_buf()];
        for subdir in ["skills", "plugins", "packages"] {
            let dir = cache.join(subdir);
            if dir.is_dir() {
                scan_dirs.push(dir);
            }
        }

        for scan_dir in scan_dirs {
            let Ok(entries) = std::fs::read_dir(&scan_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if !path.is_dir() || name.starts_with('.') {
                    continue;
                }
                let plugin_json = path.join(".claude-plugin").join("plugin.json");
                if plugin_json.exists() {
                    match parse_plugin_json(&plugin_json) {
                        Ok(manifest) => plugins.push(AvailablePlugin {
                            name: if manifest.name.is_empty() { name } else { manifest.name },
                            version: manifest.version.unwrap_or_else(|| "1.0.0".into()),
                            description: manifest.description,
                            author: manifest.author,
                            keywords: manifest.keywords,
                        }),
                        Err(e) => warn!("Failed to parse {}: {}", plugin_json.display(), e),
                    }
                } else if let Some(skill) = detect_standalone_skill(&path) {
                    plugins.push(skill);
                }
            }
        }
        plugins
    }

    /// Inspect the cache without network I/O.
    pub fn list_cached(&self, marketplace: &MarketplaceRecord) -> Vec<AvailablePlugin> {
        let cache = self.marketplace_cache_dir(marketplace);
        if !cache.exists() {
            return Vec::new();
        }
        self.scan_cache(&cache, &marketplace.name).plugins
    }

    // -- install ------------------------------------------------------------

    /// Install a plugin from the marketplace cache into the content roots
    /// and persist its record (with skill records for each installed
    /// skill). Installing an already-present plugin fails with a conflict.
    pub async fn install(
        &self,
        plugin_name: &str,
        marketplace: &MarketplaceRecord,
    ) -> ServiceResult<PluginRecord> {
        self.ensure_dirs()?;
        if self
            .db
            .find_plugin_by_name(&marketplace.id, plugin_name)?
            .is_some()
        {
            return Err(ServiceError::conflict(format!(
                "Plugin '{plugin_name}' is already installed from this marketplace"
            ))
            .with_action("Uninstall it first to reinstall"));
        }

        let cache = self.marketplace_cache_dir(marketplace);
        info!(
            "Installing plugin '{}' from marketplace '{}' (cache: {})",
            plugin_name,
            marketplace.name,
            cache.display()
        );

        let outcome = match self.install_from_manifest(plugin_name, &cache).await? {
            Some(outcome) => outcome,
            None => self.install_from_directory(plugin_name, &cache)?,
        };

        let record = self.db.put_plugin(PluginRecord {
            id: String::new(),
            marketplace_id: marketplace.id.clone(),
            name: plugin_name.to_string(),
            version: outcome.version,
            description: outcome.description,
            author: outcome.author,
            installed_skills: outcome.skills.clone(),
            installed_commands: outcome.commands,
            installed_agents: outcome.agents,
            installed_hooks: outcome.hooks,
            installed_mcp_servers: outcome.mcp_servers,
            install_path: outcome.install_path,
            status: PluginStatus::Installed,
            created_at: 0,
            updated_at: 0,
        })?;

        // Project installed skills into skill records.
        for skill_name in &outcome.skills {
            let skill_path = self.skills_dir.join(skill_name);
            let metadata = crate::skills::SkillManager::extract_metadata(&skill_path);
            let existing = self.db.find_skill_by_folder(skill_name)?;
            let put = match existing {
                Some(prior) => self.db.update_skill(&prior.id, |s| {
                    s.source_type = SkillSourceType::Plugin;
                    s.source_plugin_id = Some(record.id.clone());
                    s.source_marketplace_id = Some(marketplace.id.clone());
                    s.local_path = Some(skill_path.display().to_string());
                }),
                None => self.db.put_skill(SkillRecord {
                    id: String::new(),
                    name: metadata.name,
                    description: metadata.description,
                    folder_name: skill_name.clone(),
                    source_type: SkillSourceType::Plugin,
                    source_plugin_id: Some(record.id.clone()),
                    source_marketplace_id: Some(marketplace.id.clone()),
                    local_path: Some(skill_path.display().to_string()),
                    version: Some(metadata.version),
                    current_version: 0,
                    has_draft: false,
                    is_system: false,
                    created_by: Some("plugin".to_string()),
                    created_at: 0,
                    updated_at: 0,
                }),
            };
            if let Err(e) = put {
                warn!("Failed to record plugin skill {}: {}", skill_name, e);
            }
        }

        info!(
            "Installed plugin '{}' with {} skills",
            plugin_name,
            outcome.skills.len()
        );
        Ok(record)
    }

    async fn install_from_manifest(
        &self,
        plugin_name: &str,
        cache: &Path,
    ) -> ServiceResult<Option<InstallOutcome>> {
        let manifest_locations = [
            cache.join(".claude-plugin").join("marketplace.json"),
            cache.join("skills").join(".claude-plugin").join("marketplace.json"),
            cache.join("plugins").join(".claude-plugin").join("marketplace.json"),
        ];

        for manifest_path in manifest_locations {
            if !manifest_path.exists() {
                continue;
            }
            debug!("Checking marketplace.json at {}", manifest_path.display());
            let manifest: MarketplaceManifest = match std::fs::read_to_string(&manifest_path)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str(&c).map_err(|e| e.to_string()))
            {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to parse {}: {}", manifest_path.display(), e);
                    continue;
                }
            };

            let Some(plugin) = manifest.plugins.iter().find(|p| p.name == plugin_name) else {
                debug!("Plugin '{}' not in this marketplace.json", plugin_name);
                continue;
            };

            let mut marketplace_base = manifest_path
                .parent()
                .and_then(|p| p.parent())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cache.to_path_buf());

            // Resolve the plugin source: a remote URL is cloned on demand
            // into a nested source cache; a relative path stays local.
            let mut plugin_source_dir: Option<PathBuf> = None;
            let mut skill_paths: Vec<String> = plugin
                .skills
                .iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect();

            if skill_paths.is_empty() {
                if let Some(url) = remote_source_url(&plugin.source) {
                    match self.clone_plugin_source(&url, plugin_name, cache).await {
                        Ok(dir) => plugin_source_dir = Some(dir),
                        Err(e) => warn!("Failed to clone plugin source: {}", e),
                    }
                    if let Some(dir) = &plugin_source_dir {
                        marketplace_base = dir.clone();
                    }
                } else if let Some(dir) = local_source_dir(&plugin.source, &marketplace_base) {
                    plugin_source_dir = Some(dir);
                }

                if let Some(dir) = &plugin_source_dir {
                    let skills_dir = dir.join("skills");
                    if skills_dir.is_dir() {
                        for entry in std::fs::read_dir(&skills_dir)?.flatten() {
                            let name = entry.file_name().to_string_lossy().to_string();
                            if entry.path().is_dir() && !name.starts_with('.') {
                                skill_paths.push(format!("./skills/{name}"));
                            }
                        }
                        debug!("Auto-detected {} skills from source", skill_paths.len());
                    } else {
                        warn!("Skills directory not found at {}", skills_dir.display());
                    }
                }
            }

            let mut installed_skills = Vec::new();
            for skill_path in &skill_paths {
                let clean = skill_path.trim_start_matches("./");
                let mut source = marketplace_base.join(clean);
                if !source.exists() {
                    source = cache.join(clean);
                }
                if source.is_dir() {
                    let skill_name = source
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| clean.to_string());
                    let dest = self.skills_dir.join(&skill_name);
                    copy_dir_replacing(&source, &dest)?;
                    installed_skills.push(skill_name);
                } else {
                    warn!("Skill path not found: {} -> {}", skill_path, source.display());
                }
            }

            // install_path: the plugin source directory when known, else
            // the first installed skill directory.
            let install_path = plugin_source_dir
                .map(|d| d.display().to_string())
                .or_else(|| {
                    installed_skills
                        .first()
                        .map(|s| self.skills_dir.join(s).display().to_string())
                });

            return Ok(Some(InstallOutcome {
                version: plugin
                    .version
                    .clone()
                    .or(manifest.metadata.version.clone())
                    .unwrap_or_else(|| "1.0.0".into()),
                description: plugin.description.clone(),
                author: manifest.owner.name.clone().unwrap_or_default(),
                skills: installed_skills,
                commands: Vec::new(),
                agents: Vec::new(),
                hooks: Vec::new(),
                mcp_servers: Vec::new(),
                install_path,
            }));
        }
        Ok(None)
    }

    fn install_from_directory(&self, plugin_name: &str, cache: &Path) -> ServiceResult<InstallOutcome> {
        let search_locations = [
            cache.join(plugin_name),
            cache.join("skills").join(plugin_name),
            cache.join("plugins").join(plugin_name),
            cache.join("packages").join(plugin_name),
        ];
        let plugin_dir = search_locations
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                ServiceError::not_found(format!("Plugin '{plugin_name}' not found in marketplace cache"))
                    .with_action("Sync the marketplace and check the plugin name")
            })?;

        let plugin_json = plugin_dir.join(".claude-plugin").join("plugin.json");

        if !plugin_json.exists() {
            // Standalone skill: the whole directory is the skill.
            let skill_info = detect_standalone_skill(&plugin_dir).ok_or_else(|| {
                ServiceError::validation("Not a valid plugin or skill directory")
            })?;
            let dest = self.skills_dir.join(plugin_name);
            copy_dir_replacing(&plugin_dir, &dest)?;
            info!("Installed standalone skill: {}", plugin_name);
            return Ok(InstallOutcome {
                version: skill_info.version,
                description: skill_info.description,
                author: skill_info.author,
                skills: vec![plugin_name.to_string()],
                commands: Vec::new(),
                agents: Vec::new(),
                hooks: Vec::new(),
                mcp_servers: Vec::new(),
                install_path: Some(dest.display().to_string()),
            });
        }

        let manifest = parse_plugin_json(&plugin_json)
            .map_err(|e| ServiceError::validation(format!("Invalid plugin.json: {e}")))?;

        let mut outcome = InstallOutcome {
            version: manifest.version.unwrap_or_else(|| "1.0.0".into()),
            description: manifest.description,
            author: manifest.author,
            install_path: Some(plugin_dir.display().to_string()),
            ..InstallOutcome::default()
        };

        let skills_src = plugin_dir.join("skills");
        if skills_src.is_dir() {
            for entry in std::fs::read_dir(&skills_src)?.flatten() {
                if entry.path().is_dir() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    copy_dir_replacing(&entry.path(), &self.skills_dir.join(&name))?;
                    info!("Installed skill: {}", name);
                    outcome.skills.push(name);
                }
            }
        }
        for (src_name, dest_dir, collected) in [
            ("commands", &self.commands_dir, &mut outcome.commands),
            ("agents", &self.agents_dir, &mut outcome.agents),
            ("hooks", &self.hooks_dir, &mut outcome.hooks),
        ] {
            let src = plugin_dir.join(src_name);
            if src.is_dir() {
                std::fs::create_dir_all(dest_dir)?;
                for entry in std::fs::read_dir(&src)?.flatten() {
                    if entry.path().is_file() {
                        let name = entry.file_name().to_string_lossy().to_string();
                        std::fs::copy(entry.path(), dest_dir.join(&name))?;
                        collected.push(name);
                    }
                }
            }
        }

        let mcp_json = plugin_dir.join(".mcp.json");
        if mcp_json.exists() {
            if let Ok(content) = std::fs::read_to_string(&mcp_json) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(servers) = value.get("mcpServers").and_then(|v| v.as_object()) {
                        outcome.mcp_servers = servers.keys().cloned().collect();
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Clone a plugin's remote source into `{cache}/_sources/{plugin}`.
    async fn clone_plugin_source(
        &self,
        git_url: &str,
        plugin_name: &str,
        cache: &Path,
    ) -> ServiceResult<PathBuf> {
        let source_dir = cache.join("_sources").join(plugin_name);
        std::fs::create_dir_all(source_dir.parent().expect("source dir has parent"))?;

        let source_path = source_dir.display().to_string();
        if source_dir.exists() {
            let pull = run_git(&["-C", source_path.as_str(), "pull", "--ff-only"]).await?;
            if !pull.success {
                warn!("Git pull failed: {}, re-cloning", pull.stderr.trim());
                std::fs::remove_dir_all(&source_dir)?;
            }
        }
        if !source_dir.exists() {
            let clone = run_git(&["clone", "--depth", "1", git_url, source_path.as_str()]).await?;
            if !clone.success {
                return Err(ServiceError::backend(format!(
                    "Failed to clone {git_url}: {}",
                    clone.stderr.trim()
                )));
            }
        }
        Ok(source_dir)
    }

    // -- uninstall ----------------------------------------------------------

    /// Remove every recorded artifact from the content roots, delete the
    /// plugin's skill records, strip the plugin from agent profiles, and
    /// drop the plugin record.
    pub async fn uninstall(&self, plugin_id: &str) -> ServiceResult<RemovedArtifacts> {
        let plugin = self
            .db
            .get_plugin(plugin_id)?
            .ok_or_else(|| ServiceError::not_found(format!("Plugin '{plugin_id}' does not exist")))?;

        let mut removed = RemovedArtifacts::default();
        for skill_name in &plugin.installed_skills {
            let path = self.skills_dir.join(skill_name);
            if path.exists() {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!("Failed to remove skill {}: {}", skill_name, e);
                } else {
                    removed.skills.push(skill_name.clone());
                }
            }
        }
        for (names, dir, collected) in [
            (&plugin.installed_commands, &self.commands_dir, &mut removed.commands),
            (&plugin.installed_agents, &self.agents_dir, &mut removed.agents),
            (&plugin.installed_hooks, &self.hooks_dir, &mut removed.hooks),
        ] {
            for name in names {
                let path = dir.join(name);
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("Failed to remove {}: {}", path.display(), e);
                    } else {
                        collected.push(name.clone());
                    }
                }
            }
        }

        // Cascade: skill records sourced from this plugin.
        for skill in self.db.list_skills()? {
            if skill.source_plugin_id.as_deref() == Some(plugin_id) {
                let _ = self.db.delete_skill_versions(&skill.id);
                if let Err(e) = self.db.delete_skill(&skill.id) {
                    warn!("Failed to delete plugin skill record {}: {}", skill.id, e);
                }
            }
        }

        // Cascade: agent references.
        for agent in self.db.list_agents()? {
            if agent.plugin_ids.iter().any(|id| id == plugin_id) {
                let _ = self.db.update_agent(&agent.id, |a| {
                    a.plugin_ids.retain(|id| id != plugin_id);
                });
            }
        }

        self.db.delete_plugin(plugin_id)?;
        info!("Uninstalled plugin '{}'", plugin.name);
        Ok(removed)
    }

    /// The absolute plugin root handed to the model agent. Back-fills a
    /// missing `install_path` from the first installed skill.
    pub fn effective_install_path(&self, plugin: &PluginRecord) -> ServiceResult<Option<String>> {
        if let Some(path) = &plugin.install_path {
            return Ok(Some(path.clone()));
        }
        let Some(first_skill) = plugin.installed_skills.first() else {
            return Ok(None);
        };
        let computed = self.skills_dir.join(first_skill).display().to_string();
        info!(
            "Computed install_path for plugin {} from installed skills: {}",
            plugin.id, computed
        );
        let updated = self.db.update_plugin(&plugin.id, |p| {
            p.install_path = Some(computed.clone());
        })?;
        Ok(updated.install_path)
    }
}

#[derive(Debug, Default)]
struct InstallOutcome {
    version: String,
    description: String,
    author: String,
    skills: Vec<String>,
    commands: Vec<String>,
    agents: Vec<String>,
    hooks: Vec<String>,
    mcp_servers: Vec<String>,
    install_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct GitOutput {
    success: bool,
    stderr: String,
}

async fn run_git(args: &[&str]) -> ServiceResult<GitOutput> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|e| ServiceError::backend(format!("Failed to run git: {e}")))?;
    Ok(GitOutput {
        success: output.status.success(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Extract `{owner}/{repo}` from common Git URL shapes.
fn owner_repo_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let rest = if let Some(rest) = trimmed.strip_prefix("git@") {
        rest.split_once(':').map(|(_, path)| path)?
    } else if trimmed.contains("://") {
        let parsed = url::Url::parse(trimmed).ok()?;
        let path = parsed.path().trim_start_matches('/');
        if path.is_empty() {
            return None;
        }
        return owner_repo_from_path(path);
    } else {
        trimmed
    };
    owner_repo_from_path(rest)
}

fn owner_repo_from_path(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 2 {
        Some(format!("{}/{}", parts[0], parts[1]))
    } else {
        None
    }
}

fn local_source_dir(source: &Option<serde_json::Value>, base: &Path) -> Option<PathBuf> {
    let raw = source.as_ref()?.as_str()?;
    let clean = raw.trim_start_matches("./");
    if clean.is_empty() {
        Some(base.to_path_buf())
    } else {
        Some(base.join(clean))
    }
}

fn remote_source_url(source: &Option<serde_json::Value>) -> Option<String> {
    let obj = source.as_ref()?.as_object()?;
    if obj.get("source").and_then(|v| v.as_str()) == Some("url") {
        obj.get("url").and_then(|v| v.as_str()).map(String::from)
    } else {
        None
    }
}

fn count_skill_dirs(skills_dir: &Path) -> usize {
    std::fs::read_dir(skills_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.path().is_dir()
                        && !e.file_name().to_string_lossy().starts_with('.')
                })
                .count()
        })
        .unwrap_or(0)
}

fn parse_plugin_json(path: &Path) -> Result<PluginManifest, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

/// A directory with markdown content (or a `skill.json`) is a standalone
/// skill even without plugin metadata.
fn detect_standalone_skill(dir: &Path) -> Option<AvailablePlugin> {
    let name = dir.file_name()?.to_string_lossy().to_string();

    let skill_json = dir.join("skill.json");
    if skill_json.exists() {
        if let Ok(content) = std::fs::read_to_string(&skill_json) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
                return Some(AvailablePlugin {
                    name: value
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&name)
                        .to_string(),
                    version: value
                        .get("version")
                        .and_then(|v| v.as_str())
                        .unwrap_or("1.0.0")
                        .to_string(),
                    description: value
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    author: value
                        .get("author")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    keywords: vec!["skill".to_string()],
                });
            }
        }
    }

    let md_files: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "md"))
        .collect();
    if md_files.is_empty() {
        return None;
    }

    // First non-heading line of the primary markdown file is the description.
    let mut description = String::new();
    let primary_names = [
        "readme.md".to_string(),
        "skill.md".to_string(),
        format!("{}.md", name.to_lowercase()),
    ];
    for md in &md_files {
        let file_name = md
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if primary_names.contains(&file_name) {
            if let Ok(content) = std::fs::read_to_string(md) {
                for line in content.lines() {
                    let line = line.trim();
                    if !line.is_empty() && !line.starts_with('#') && !line.starts_with("```") {
                        description = crate::util::preview(line, 200);
                        break;
                    }
                }
            }
            break;
        }
    }

    Some(AvailablePlugin {
        name,
        version: "1.0.0".to_string(),
        description,
        author: String::new(),
        keywords: vec!["skill".to_string()],
    })
}

fn copy_dir_replacing(src: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    copy_dir_recursive(src, dest)
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

pub(crate) fn http_client() -> ServiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("maestro")
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ServiceError::backend(format!("Failed to build HTTP client: {e}")))
}

const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Fetch a URL into a kept temp file. Transient failures (connection
/// errors, 429, any 5xx) get a short linear backoff and another try;
/// anything else fails immediately.
pub(crate) async fn download_to_temp(client: &reqwest::Client, url: &str) -> ServiceResult<PathBuf> {
    let mut failure: Option<String> = None;

    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
        }

        let response = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Fetch of {} failed on attempt {}: {}", url, attempt, e);
                failure = Some(e.to_string());
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ServiceError::backend(format!("Failed to read response body: {e}")))?;
            let (_file, path) = tempfile::NamedTempFile::new()?
                .keep()
                .map_err(|e| ServiceError::backend(format!("Failed to persist download: {}", e.error)))?;
            std::fs::write(&path, &bytes)?;
            return Ok(path);
        }

        failure = Some(format!("HTTP {status}"));
        if !is_retryable_status(status) {
            break;
        }
        warn!("Server answered {} for {} on attempt {}, will retry", status, url, attempt);
    }

    Err(ServiceError::backend(format!(
        "Could not fetch {url}: {}",
        failure.unwrap_or_else(|| "no response".into())
    )))
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Extract a repository ZIP into the cache directory, flattening a single
/// wrapping root folder (the shape GitHub archives use).
fn extract_archive_to_dir(zip_path: &Path, dest: &Path) -> ServiceResult<()> {
    use zip::ZipArchive;

    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;

    let file = std::fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ServiceError::validation(format!("Invalid archive: {e}")))?;

    let mut roots = std::collections::BTreeSet::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| ServiceError::validation(format!("Invalid archive entry: {e}")))?;
        if let Some(first) = entry.name().split('/').next() {
            if !first.is_empty() {
                roots.insert(first.to_string());
            }
        }
    }
    let strip_root = if roots.len() == 1 { roots.into_iter().next() } else { None };

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ServiceError::validation(format!("Invalid archive entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let rel = match &strip_root {
            Some(root) => name
                .strip_prefix(root.as_str())
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or(name.as_str()),
            None => name.as_str(),
        };
        if rel.is_empty() || rel.contains("..") || rel.starts_with('/') {
            continue;
        }
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| ServiceError::backend(format!("Failed to extract {rel}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        manager: PluginManager,
        skills_dir: PathBuf,
        commands_dir: PathBuf,
        market_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(&dir.path().join("test.redb")).unwrap());
        let skills_dir = dir.path().join("claude/skills");
        let commands_dir = dir.path().join("claude/commands");
        let agents_dir = dir.path().join("claude/agents");
        let hooks_dir = dir.path().join("claude/hooks");
        let market_root = dir.path().join("market");
        std::fs::create_dir_all(&market_root).unwrap();
        let manager = PluginManager::new(
            db.clone(),
            dir.path().join("claude/plugins/cache"),
            skills_dir.clone(),
            commands_dir.clone(),
            agents_dir,
            hooks_dir,
        );
        Fixture {
            _dir: dir,
            db,
            manager,
            skills_dir,
            commands_dir,
            market_root,
        }
    }

    fn local_marketplace(f: &Fixture) -> MarketplaceRecord {
        f.db.put_marketplace(MarketplaceRecord {
            id: String::new(),
            name: "test-market".to_string(),
            kind: MarketplaceKind::Local,
            url: f.market_root.display().to_string(),
            branch: "main".to_string(),
            cached_plugins: Vec::new(),
            last_synced_at: None,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap()
    }

    fn write_skill(root: &Path, rel: &str, name: &str) {
        let dir = root.join(rel).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), format!("# {name}\n\nSkill {name}.\n")).unwrap();
    }

    fn write_marketplace_manifest(root: &Path, json: &str) {
        let dir = root.join(".claude-plugin");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("marketplace.json"), json).unwrap();
    }

    /// Build a repository archive the way forges serve them: every entry
    /// wrapped in a single `{repo}-{branch}/` root folder.
    fn repo_archive(root_folder: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            for (path, content) in files {
                writer
                    .start_file(format!("{root_folder}/{path}"), options)
                    .unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    /// One-shot HTTP server: answers each accepted connection with the
    /// next queued (status, body) pair, then goes away.
    async fn spawn_http_server(responses: Vec<(u16, Vec<u8>)>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut request = [0u8; 2048];
                let _ = stream.read(&mut request).await;
                let reason = if status == 200 { "OK" } else { "Error" };
                let header = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{addr}/archive.zip")
    }

    #[test]
    fn test_owner_repo_from_url() {
        assert_eq!(
            owner_repo_from_url("https://github.com/acme/skills.git"),
            Some("acme/skills".to_string())
        );
        assert_eq!(
            owner_repo_from_url("git@github.com:acme/skills.git"),
            Some("acme/skills".to_string())
        );
        assert_eq!(owner_repo_from_url("acme/skills"), Some("acme/skills".to_string()));
        assert_eq!(owner_repo_from_url("https://example.com/"), None);
    }

    #[tokio::test]
    async fn test_sync_local_marketplace_with_manifest() {
        let f = fixture();
        write_skill(&f.market_root, "skills", "a");
        write_skill(&f.market_root, "skills", "b");
        write_marketplace_manifest(
            &f.market_root,
            r#"{
                "name": "Acme Marketplace",
                "metadata": {"version": "2.0.0"},
                "owner": {"name": "Acme"},
                "plugins": [
                    {"name": "docs-pack", "description": "Document skills", "skills": ["./skills/a", "./skills/b"]}
                ]
            }"#,
        );

        let marketplace = local_marketplace(&f);
        let result = f.manager.sync(&marketplace).await.unwrap();
        assert!(result.is_marketplace);
        assert_eq!(result.marketplace_name.as_deref(), Some("Acme Marketplace"));
        assert_eq!(result.plugins.len(), 1);
        assert_eq!(result.plugins[0].name, "docs-pack");
        assert_eq!(result.plugins[0].version, "2.0.0");
        assert_eq!(result.plugins[0].author, "Acme");
        assert_eq!(result.plugins[0].keywords, vec!["2 skills".to_string()]);

        let updated = f.db.get_marketplace(&marketplace.id).unwrap().unwrap();
        assert!(updated.last_synced_at.is_some());
        assert_eq!(updated.cached_plugins, vec!["docs-pack".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_detects_single_plugin_repo() {
        let f = fixture();
        write_skill(&f.market_root, "skills", "solo");
        let marketplace = local_marketplace(&f);
        let result = f.manager.sync(&marketplace).await.unwrap();
        assert!(!result.is_marketplace);
        assert_eq!(result.plugins.len(), 1);
        assert_eq!(result.plugins[0].description, "Plugin with 1 skills");
    }

    #[tokio::test]
    async fn test_manifest_auto_detects_skills_from_source() {
        let f = fixture();
        write_skill(&f.market_root, "skills", "x");
        write_marketplace_manifest(
            &f.market_root,
            r#"{"name": "M", "plugins": [{"name": "auto", "source": "./"}]}"#,
        );
        let marketplace = local_marketplace(&f);
        let result = f.manager.sync(&marketplace).await.unwrap();
        assert_eq!(result.plugins[0].keywords, vec!["1 skills".to_string()]);
    }

    #[tokio::test]
    async fn test_install_from_manifest_and_uninstall() {
        let f = fixture();
        write_skill(&f.market_root, "skills", "a");
        write_skill(&f.market_root, "skills", "b");
        write_marketplace_manifest(
            &f.market_root,
            r#"{
                "name": "Acme",
                "metadata": {"version": "1.0.0"},
                "plugins": [{"name": "p", "skills": ["./skills/a", "./skills/b"]}]
            }"#,
        );
        let marketplace = local_marketplace(&f);
        f.manager.sync(&marketplace).await.unwrap();

        let plugin = f.manager.install("p", &marketplace).await.unwrap();
        assert_eq!(plugin.installed_skills, vec!["a".to_string(), "b".to_string()]);
        assert!(plugin.install_path.is_some());
        assert!(f.skills_dir.join("a/SKILL.md").exists());
        assert!(f.skills_dir.join("b/SKILL.md").exists());

        // Skill records projected with plugin source
        for folder in ["a", "b"] {
            let skill = f.db.find_skill_by_folder(folder).unwrap().unwrap();
            assert_eq!(skill.source_type, SkillSourceType::Plugin);
            assert_eq!(skill.source_plugin_id.as_deref(), Some(plugin.id.as_str()));
        }

        // Second install of the same plugin conflicts
        let err = f.manager.install("p", &marketplace).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        // Agent referencing the plugin
        let agent = f
            .db
            .put_agent(crate::db::AgentRecord {
                id: String::new(),
                name: "uses-plugin".into(),
                description: None,
                instructions: None,
                model: None,
                permission_mode: Default::default(),
                allowed_tools: vec![],
                plugin_ids: vec![plugin.id.clone()],
                skill_ids: vec![],
                allow_all_skills: false,
                mcp_ids: vec![],
                working_directory: None,
                enable_bash_tool: true,
                enable_file_tools: true,
                enable_web_tools: false,
                enable_tool_logging: true,
                enable_safety_checks: true,
                enable_file_access_control: true,
                allowed_directories: vec![],
                global_user_mode: false,
                enable_human_approval: true,
                sandbox: Default::default(),
                status: Default::default(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();

        let removed = f.manager.uninstall(&plugin.id).await.unwrap();
        assert_eq!(removed.skills, vec!["a".to_string(), "b".to_string()]);
        assert!(!f.skills_dir.join("a").exists());
        assert!(f.db.get_plugin(&plugin.id).unwrap().is_none());
        // No skill record references the plugin id
        assert!(f.db.find_skill_by_folder("a").unwrap().is_none());
        assert!(f.db.find_skill_by_folder("b").unwrap().is_none());
        // No agent record contains the plugin id
        assert!(f.db.get_agent(&agent.id).unwrap().plugin_ids.is_empty());
    }

    #[tokio::test]
    async fn test_install_full_plugin_directory() {
        let f = fixture();
        let plugin_dir = f.market_root.join("toolkit");
        std::fs::create_dir_all(plugin_dir.join(".claude-plugin")).unwrap();
        std::fs::write(
            plugin_dir.join(".claude-plugin/plugin.json"),
            r#"{"name": "toolkit", "version": "3.1.0", "description": "Tools", "author": "Acme"}"#,
        )
        .unwrap();
        write_skill(&plugin_dir, "skills", "s1");
        std::fs::create_dir_all(plugin_dir.join("commands")).unwrap();
        std::fs::write(plugin_dir.join("commands/deploy.md"), "# deploy\n").unwrap();

        let marketplace = local_marketplace(&f);
        let plugin = f.manager.install("toolkit", &marketplace).await.unwrap();
        assert_eq!(plugin.version, "3.1.0");
        assert_eq!(plugin.installed_skills, vec!["s1".to_string()]);
        assert_eq!(plugin.installed_commands, vec!["deploy.md".to_string()]);
        assert!(f.commands_dir.join("deploy.md").exists());
        assert_eq!(
            plugin.install_path.as_deref(),
            Some(plugin_dir.display().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_install_standalone_skill() {
        let f = fixture();
        let dir = f.market_root.join("note-helper");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README.md"), "# Note helper\n\nKeeps notes tidy.\n").unwrap();

        let marketplace = local_marketplace(&f);
        let plugin = f.manager.install("note-helper", &marketplace).await.unwrap();
        assert_eq!(plugin.installed_skills, vec!["note-helper".to_string()]);
        assert_eq!(plugin.description, "Keeps notes tidy.");
        assert!(f.skills_dir.join("note-helper/README.md").exists());
    }

    #[tokio::test]
    async fn test_install_unknown_plugin_not_found() {
        let f = fixture();
        let marketplace = local_marketplace(&f);
        let err = f.manager.install("ghost", &marketplace).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_cached_without_network() {
        let f = fixture();
        write_skill(&f.market_root, "skills", "cached");
        write_marketplace_manifest(
            &f.market_root,
            r#"{"name": "C", "plugins": [{"name": "cp", "skills": ["./skills/cached"]}]}"#,
        );
        let marketplace = local_marketplace(&f);
        let plugins = f.manager.list_cached(&marketplace);
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "cp");
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(reqwest::StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(reqwest::StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(reqwest::StatusCode::OK));
    }

    #[tokio::test]
    async fn test_download_retries_transient_errors() {
        let url = spawn_http_server(vec![
            (503, b"busy".to_vec()),
            (200, b"payload".to_vec()),
        ])
        .await;

        let client = http_client().unwrap();
        let path = download_to_temp(&client, &url).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_download_gives_up_on_client_error() {
        let url = spawn_http_server(vec![(404, b"gone".to_vec())]).await;

        let client = http_client().unwrap();
        let err = download_to_temp(&client, &url).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BackendUnavailable);
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_sync_http_marketplace_end_to_end() {
        let archive = repo_archive(
            "acme-skills-main",
            &[
                (
                    ".claude-plugin/marketplace.json",
                    r#"{
                        "name": "Acme Remote",
                        "metadata": {"version": "1.2.0"},
                        "plugins": [{"name": "web-pack", "skills": ["./skills/web"]}]
                    }"#,
                ),
                ("skills/web/SKILL.md", "# web\n\nWeb helpers.\n"),
            ],
        );
        let url = spawn_http_server(vec![(200, archive)]).await;

        let f = fixture();
        let marketplace = f
            .db
            .put_marketplace(MarketplaceRecord {
                id: String::new(),
                name: "acme-http".to_string(),
                kind: MarketplaceKind::Http,
                url,
                branch: "main".to_string(),
                cached_plugins: Vec::new(),
                last_synced_at: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();

        // Sync downloads the archive and extracts it into the cache with
        // the wrapping root folder stripped.
        let result = f.manager.sync(&marketplace).await.unwrap();
        assert!(result.is_marketplace);
        assert_eq!(result.marketplace_name.as_deref(), Some("Acme Remote"));
        assert_eq!(result.plugins.len(), 1);
        assert_eq!(result.plugins[0].name, "web-pack");

        let cache = f.manager.marketplace_cache_dir(&marketplace);
        assert!(cache.join(".claude-plugin/marketplace.json").exists());
        assert!(cache.join("skills/web/SKILL.md").exists());

        // Installing from the synced cache works like any other source.
        let plugin = f.manager.install("web-pack", &marketplace).await.unwrap();
        assert_eq!(plugin.installed_skills, vec!["web".to_string()]);
        assert!(f.skills_dir.join("web/SKILL.md").exists());
    }

    #[tokio::test]
    async fn test_effective_install_path_backfill() {
        let f = fixture();
        let plugin = f
            .db
            .put_plugin(PluginRecord {
                id: String::new(),
                marketplace_id: "m".into(),
                name: "legacy".into(),
                version: "1.0.0".into(),
                description: String::new(),
                author: String::new(),
                installed_skills: vec!["first".to_string()],
                installed_commands: vec![],
                installed_agents: vec![],
                installed_hooks: vec![],
                installed_mcp_servers: vec![],
                install_path: None,
                status: PluginStatus::Installed,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();

        let path = f.manager.effective_install_path(&plugin).unwrap().unwrap();
        assert!(path.ends_with("first"));
        // Persisted back
        let reloaded = f.db.get_plugin(&plugin.id).unwrap().unwrap();
        assert_eq!(reloaded.install_path.as_deref(), Some(path.as_str()));
    }
}

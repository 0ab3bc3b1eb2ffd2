pub mod marketplace;

use crate::db::{Db, SkillRecord, SkillSourceType, SkillVersionRecord};
use crate::error::{ServiceError, ServiceResult};
use crate::util::sanitize_folder_name;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zip::ZipArchive;

const DRAFT_FOLDER: &str = "draft";
const VERSION_PREFIX: &str = "v";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Metadata extracted from SKILL.md, best effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncResult {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<SyncErrorEntry>,
    pub total_local: usize,
    pub total_plugins: usize,
    pub total_db: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorEntry {
    pub skill: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// SkillManager
// ---------------------------------------------------------------------------

/// Skill storage with a draft / numbered-versions lifecycle.
///
/// Layout per skill under the staging root:
///
/// ```text
/// {staging}/{folder}/draft/   zero or one unpublished working copy
/// {staging}/{folder}/v1/      immutable published snapshots
/// {staging}/{folder}/v2/
/// ```
///
/// The live mirror `{workspace}/.claude/skills/{folder}` always reflects
/// the currently published version; that is what the model agent loads.
pub struct SkillManager {
    db: Arc<Db>,
    /// Live mirror root: `{workspace}/.claude/skills/`.
    local_dir: PathBuf,
    /// Staging root for drafts and version snapshots.
    staging_dir: PathBuf,
    /// Per-skill serialization for publish/rollback.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SkillManager {
    pub fn new(db: Arc<Db>, local_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            db,
            local_dir,
            staging_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.local_dir)?;
        std::fs::create_dir_all(&self.staging_dir)?;
        Ok(())
    }

    async fn skill_lock(&self, skill_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(skill_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn mirror_path(&self, folder_name: &str) -> PathBuf {
        self.local_dir.join(folder_name)
    }

    fn draft_path(&self, folder_name: &str) -> PathBuf {
        self.staging_dir.join(folder_name).join(DRAFT_FOLDER)
    }

    fn version_path(&self, folder_name: &str, version: u32) -> PathBuf {
        self.staging_dir
            .join(folder_name)
            .join(format!("{VERSION_PREFIX}{version}"))
    }

    // -- metadata -----------------------------------------------------------

    /// Derive `{name, description, version}` from SKILL.md.
    ///
    /// YAML frontmatter wins when present; otherwise the first H1 becomes
    /// the name, the first paragraph after it the description, and the
    /// first `version: X.Y.Z` line the version.
    pub fn extract_metadata(skill_dir: &Path) -> SkillMetadata {
        let fallback_name = skill_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("skill")
            .to_string();
        let mut metadata = SkillMetadata {
            name: fallback_name.clone(),
            description: format!("Skill: {fallback_name}"),
            version: "1.0.0".to_string(),
        };

        let Ok(content) = std::fs::read_to_string(skill_dir.join("SKILL.md")) else {
            return metadata;
        };

        if content.starts_with("---") {
            let parts: Vec<&str> = content.splitn(3, "---").collect();
            if parts.len() >= 3 {
                if let Ok(front) = serde_yaml::from_str::<SkillFrontmatter>(parts[1]) {
                    if let Some(name) = front.name.filter(|n| !n.is_empty()) {
                        metadata.name = name;
                    }
                    if let Some(description) = front.description.filter(|d| !d.is_empty()) {
                        metadata.description = description;
                    }
                    if let Some(version) = front.version.filter(|v| !v.is_empty()) {
                        metadata.version = version;
                    }
                    return metadata;
                }
            }
        }

        let heading = Regex::new(r"(?m)^#\s+(.+)$").expect("valid regex");
        if let Some(caps) = heading.captures(&content) {
            metadata.name = caps[1].trim().to_string();
        }
        let paragraph = Regex::new(r"(?m)^#[^\n]+\n+([^\n#]+)").expect("valid regex");
        if let Some(caps) = paragraph.captures(&content) {
            metadata.description = caps[1].trim().to_string();
        }
        let version = Regex::new(r"[Vv]ersion[:\s]+([0-9.]+)").expect("valid regex");
        if let Some(caps) = version.captures(&content) {
            metadata.version = caps[1].to_string();
        }
        metadata
    }

    // -- ZIP handling -------------------------------------------------------

    fn validate_zip_has_skill_md(zip_path: &Path) -> ServiceResult<()> {
        let file = std::fs::File::open(zip_path)?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| ServiceError::validation(format!("Invalid ZIP archive: {e}")))?;
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| ServiceError::validation(format!("Invalid ZIP entry: {e}")))?;
            let name = entry.name();
            if name == "SKILL.md" || name.ends_with("/SKILL.md") {
                return Ok(());
            }
        }
        Err(ServiceError::validation("ZIP must contain a SKILL.md file")
            .with_action("Ensure your ZIP contains a valid SKILL.md file"))
    }

    /// Extract a skill ZIP into `dest_dir`, replacing any previous content.
    /// A single root folder inside the archive is flattened away.
    fn extract_zip_to_dir(zip_path: &Path, dest_dir: &Path) -> ServiceResult<()> {
        if dest_dir.exists() {
            std::fs::remove_dir_all(dest_dir)?;
        }
        std::fs::create_dir_all(dest_dir)?;

        let file = std::fs::File::open(zip_path)?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| ServiceError::validation(format!("Invalid ZIP archive: {e}")))?;

        // Detect a single root folder wrapping the content.
        let mut root_folders = std::collections::BTreeSet::new();
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| ServiceError::validation(format!("Invalid ZIP entry: {e}")))?;
            let name = entry.name().to_string();
            let mut parts = name.split('/');
            if let (Some(first), Some(_)) = (parts.next(), parts.next()) {
                if !first.is_empty() {
                    root_folders.insert(first.to_string());
                }
            }
        }
        let strip_root = if root_folders.len() == 1 {
            root_folders.into_iter().next()
        } else {
            None
        };

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| ServiceError::validation(format!("Invalid ZIP entry: {e}")))?;
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
            let dest = dest_dir.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| ServiceError::backend(format!("Failed to extract {rel}: {e}")))?;
        }
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Upload a skill package as a draft. The ZIP must contain SKILL.md;
    /// the existing draft, if any, is replaced.
    pub async fn upload_package(
        &self,
        zip_content: &[u8],
        name: Option<&str>,
        original_filename: &str,
    ) -> ServiceResult<SkillRecord> {
        self.ensure_dirs()?;
        let raw_name = name
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| original_filename.trim_end_matches(".zip").to_string());
        let folder_name = sanitize_folder_name(&raw_name);
        if folder_name.is_empty() {
            return Err(ServiceError::validation("Skill name must not be empty"));
        }

        let mut tmp = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut tmp, zip_content)?;
        let tmp_path = tmp.path().to_path_buf();

        Self::validate_zip_has_skill_md(&tmp_path)?;
        let draft_dir = self.draft_path(&folder_name);
        Self::extract_zip_to_dir(&tmp_path, &draft_dir)?;

        let metadata = Self::extract_metadata(&draft_dir);

        let record = match self.db.find_skill_by_folder(&folder_name)? {
            Some(existing) if existing.source_type == SkillSourceType::Plugin => {
                return Err(ServiceError::conflict(format!(
                    "Skill '{folder_name}' is installed by a plugin and cannot be replaced"
                )));
            }
            Some(existing) => self.db.update_skill(&existing.id, |skill| {
                skill.has_draft = true;
                skill.description = metadata.description.clone();
                skill.version = Some(metadata.version.clone());
            })?,
            None => self.db.put_skill(SkillRecord {
                id: String::new(),
                name: metadata.name.clone(),
                description: metadata.description.clone(),
                folder_name: folder_name.clone(),
                source_type: SkillSourceType::User,
                source_plugin_id: None,
                source_marketplace_id: None,
                local_path: None,
                version: Some(metadata.version.clone()),
                current_version: 0,
                has_draft: true,
                is_system: false,
                created_by: Some("user".to_string()),
                created_at: 0,
                updated_at: 0,
            })?,
        };
        info!("Uploaded draft for skill '{}' ({})", folder_name, record.id);
        Ok(record)
    }

    /// Stage a draft from a folder already present in the live mirror
    /// (e.g. written there by a skill-creation conversation). Creates the
    /// skill record when new.
    pub async fn finalize_from_local(
        &self,
        folder_name: &str,
        display_name: Option<&str>,
    ) -> ServiceResult<SkillRecord> {
        self.ensure_dirs()?;
        let folder_name = sanitize_folder_name(folder_name);
        let source = self.mirror_path(&folder_name);
        if !source.exists() {
            return Err(ServiceError::not_found(format!(
                "Skill directory not found: {}",
                source.display()
            ))
            .with_action("Ensure the skill was created successfully before finalizing"));
        }
        if !source.join("SKILL.md").exists() {
            return Err(ServiceError::validation(format!(
                "Skill directory exists but is missing SKILL.md: {}",
                source.display()
            )));
        }

        let draft_dir = self.draft_path(&folder_name);
        copy_dir_replacing(&source, &draft_dir)?;
        let metadata = Self::extract_metadata(&draft_dir);
        let name = display_name
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .unwrap_or(metadata.name.clone());

        let record = match self.db.find_skill_by_folder(&folder_name)? {
            Some(existing) if existing.source_type == SkillSourceType::Plugin => {
                return Err(ServiceError::conflict(format!(
                    "Skill '{folder_name}' is installed by a plugin and cannot be replaced"
                )));
            }
            Some(existing) => self.db.update_skill(&existing.id, |skill| {
                skill.name = name.clone();
                skill.description = metadata.description.clone();
                skill.version = Some(metadata.version.clone());
                skill.has_draft = true;
                skill.local_path = Some(source.display().to_string());
            })?,
            None => self.db.put_skill(SkillRecord {
                id: String::new(),
                name,
                description: metadata.description.clone(),
                folder_name: folder_name.clone(),
                source_type: SkillSourceType::User,
                source_plugin_id: None,
                source_marketplace_id: None,
                local_path: Some(source.display().to_string()),
                version: Some(metadata.version.clone()),
                current_version: 0,
                has_draft: true,
                is_system: false,
                created_by: Some("agent".to_string()),
                created_at: 0,
                updated_at: 0,
            })?,
        };
        Ok(record)
    }

    /// Promote the draft to `current_version + 1`. The draft folder becomes
    /// the immutable version snapshot and the live mirror is refreshed.
    pub async fn publish_draft(
        &self,
        skill_id: &str,
        change_summary: Option<String>,
    ) -> ServiceResult<(SkillRecord, SkillVersionRecord)> {
        let lock = self.skill_lock(skill_id).await;
        let _guard = lock.lock().await;

        let skill = self.db.get_skill(skill_id)?;
        if skill.source_type == SkillSourceType::Plugin {
            return Err(ServiceError::conflict(
                "Plugin-installed skills are managed by their plugin and cannot be published",
            ));
        }
        if !skill.has_draft {
            return Err(ServiceError::conflict(format!(
                "Skill '{}' has no draft to publish",
                skill.folder_name
            ))
            .with_action("Upload or stage a draft first"));
        }

        let draft_dir = self.draft_path(&skill.folder_name);
        if !draft_dir.exists() {
            return Err(ServiceError::backend(format!(
                "Draft staging missing for skill '{}'",
                skill.folder_name
            )));
        }

        let new_version = skill.current_version + 1;
        let version_dir = self.version_path(&skill.folder_name, new_version);
        if version_dir.exists() {
            std::fs::remove_dir_all(&version_dir)?;
        }
        std::fs::rename(&draft_dir, &version_dir)
            .or_else(|_| -> std::io::Result<()> {
                copy_dir_replacing(&draft_dir, &version_dir)?;
                std::fs::remove_dir_all(&draft_dir)
            })
            .map_err(|e| ServiceError::backend(format!("Failed to promote draft: {e}")))?;

        // Refresh the live mirror so the agent loads the new version.
        let mirror = self.mirror_path(&skill.folder_name);
        copy_dir_replacing(&version_dir, &mirror)?;

        let metadata = Self::extract_metadata(&version_dir);
        let record = self.db.update_skill(skill_id, |s| {
            s.current_version = new_version;
            s.has_draft = false;
            s.local_path = Some(mirror.display().to_string());
            s.version = Some(metadata.version.clone());
        })?;
        let version_record = self.db.put_skill_version(SkillVersionRecord {
            id: String::new(),
            skill_id: skill_id.to_string(),
            version: new_version,
            change_summary,
            content_path: Some(version_dir.display().to_string()),
            created_at: 0,
            updated_at: 0,
        })?;

        info!("Published skill '{}' as v{}", record.folder_name, new_version);
        Ok((record, version_record))
    }

    /// Drop the unpublished draft.
    pub async fn discard_draft(&self, skill_id: &str) -> ServiceResult<SkillRecord> {
        let lock = self.skill_lock(skill_id).await;
        let _guard = lock.lock().await;

        let skill = self.db.get_skill(skill_id)?;
        if !skill.has_draft {
            return Err(ServiceError::conflict(format!(
                "Skill '{}' has no draft to discard",
                skill.folder_name
            )));
        }
        let draft_dir = self.draft_path(&skill.folder_name);
        if draft_dir.exists() {
            std::fs::remove_dir_all(&draft_dir)?;
        }
        self.db.update_skill(skill_id, |s| s.has_draft = false)
    }

    /// List published versions, newest-first.
    pub fn list_versions(&self, skill_id: &str) -> ServiceResult<Vec<SkillVersionRecord>> {
        // Existence check first so unknown ids surface as not_found.
        let _ = self.db.get_skill(skill_id)?;
        self.db.list_skill_versions(skill_id)
    }

    /// Make version `v` current: any draft is discarded and the live
    /// mirror is replaced with the snapshot of `v`.
    pub async fn rollback(&self, skill_id: &str, version: u32) -> ServiceResult<SkillRecord> {
        let lock = self.skill_lock(skill_id).await;
        let _guard = lock.lock().await;

        let skill = self.db.get_skill(skill_id)?;
        let version_record = self
            .db
            .get_skill_version(skill_id, version)?
            .ok_or_else(|| {
                ServiceError::not_found(format!(
                    "Version {} of skill '{}' does not exist",
                    version, skill.folder_name
                ))
            })?;

        let version_dir = version_record
            .content_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.version_path(&skill.folder_name, version));
        if !version_dir.exists() {
            return Err(ServiceError::backend(format!(
                "Snapshot for v{} of '{}' is missing from staging",
                version, skill.folder_name
            )));
        }

        let draft_dir = self.draft_path(&skill.folder_name);
        if draft_dir.exists() {
            std::fs::remove_dir_all(&draft_dir)?;
        }

        let mirror = self.mirror_path(&skill.folder_name);
        copy_dir_replacing(&version_dir, &mirror)?;

        let record = self.db.update_skill(skill_id, |s| {
            s.current_version = version;
            s.has_draft = false;
            s.local_path = Some(mirror.display().to_string());
        })?;
        info!("Rolled back skill '{}' to v{}", record.folder_name, version);
        Ok(record)
    }

    /// Delete a skill: staging tree, live mirror, version records, agent
    /// references, then the record itself. Filesystem failures are logged
    /// and do not prevent removal of the database row.
    pub async fn delete(&self, skill_id: &str) -> ServiceResult<()> {
        let skill = self.db.get_skill(skill_id)?;
        if skill.is_system {
            return Err(ServiceError::validation("System skills are protected and cannot be deleted")
                .with_action("Only user-created skills can be deleted"));
        }

        for dir in [
            self.staging_dir.join(&skill.folder_name),
            self.mirror_path(&skill.folder_name),
        ] {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!("Failed to delete skill files at {}: {}", dir.display(), e);
                }
            }
        }

        if let Err(e) = self.db.delete_skill_versions(skill_id) {
            warn!("Failed to delete version records for {}: {}", skill_id, e);
        }

        // Remove references from agent profiles.
        for agent in self.db.list_agents()? {
            if agent.skill_ids.iter().any(|id| id == skill_id) {
                let removed = self.db.update_agent(&agent.id, |a| {
                    a.skill_ids.retain(|id| id != skill_id);
                });
                if let Err(e) = removed {
                    warn!("Failed to strip skill {} from agent {}: {}", skill_id, agent.id, e);
                }
            }
        }

        self.db.delete_skill(skill_id)?;
        info!("Deleted skill '{}' ({})", skill.folder_name, skill_id);
        Ok(())
    }

    /// Reconcile the live mirror directory with database records.
    ///
    /// Orphan local folders become `user` records; records whose folder is
    /// missing are flagged (not deleted); plugin-sourced skills are never
    /// touched.
    pub async fn refresh(&self) -> ServiceResult<SyncResult> {
        self.ensure_dirs()?;
        let mut result = SyncResult::default();

        let mut local_skills: HashMap<String, PathBuf> = HashMap::new();
        for entry in std::fs::read_dir(&self.local_dir)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !path.is_dir() || name.starts_with('.') {
                continue;
            }
            if path.join("SKILL.md").exists() {
                local_skills.insert(name, path);
            } else {
                debug!("Skipping directory without SKILL.md: {}", name);
            }
        }

        let db_skills = self.db.list_skills()?;
        result.total_db = db_skills.len();
        result.total_local = local_skills.len();

        let mut user_map: HashMap<String, SkillRecord> = HashMap::new();
        let mut plugin_set: std::collections::HashSet<String> = std::collections::HashSet::new();
        for skill in db_skills {
            if skill.source_type == SkillSourceType::Plugin {
                plugin_set.insert(skill.folder_name.clone());
            } else {
                user_map.insert(skill.folder_name.clone(), skill);
            }
        }
        result.total_plugins = plugin_set.len();

        for (folder_name, path) in &local_skills {
            if plugin_set.contains(folder_name) {
                debug!("Skill {}: from plugin, skipping", folder_name);
                continue;
            }
            match user_map.get(folder_name) {
                None => {
                    let metadata = Self::extract_metadata(path);
                    let put = self.db.put_skill(SkillRecord {
                        id: String::new(),
                        name: metadata.name,
                        description: metadata.description,
                        folder_name: folder_name.clone(),
                        source_type: SkillSourceType::User,
                        source_plugin_id: None,
                        source_marketplace_id: None,
                        local_path: Some(path.display().to_string()),
                        version: Some(metadata.version),
                        current_version: 0,
                        has_draft: false,
                        is_system: false,
                        created_by: Some("sync".to_string()),
                        created_at: 0,
                        updated_at: 0,
                    });
                    match put {
                        Ok(_) => {
                            info!("Skill {}: local only, added to DB", folder_name);
                            result.added.push(folder_name.clone());
                        }
                        Err(e) => result.errors.push(SyncErrorEntry {
                            skill: folder_name.clone(),
                            error: e.to_string(),
                        }),
                    }
                }
                Some(existing) => {
                    let current_path = path.display().to_string();
                    if existing.local_path.as_deref() != Some(current_path.as_str()) {
                        let update = self
                            .db
                            .update_skill(&existing.id, |s| s.local_path = Some(current_path.clone()));
                        match update {
                            Ok(_) => result.updated.push(folder_name.clone()),
                            Err(e) => result.errors.push(SyncErrorEntry {
                                skill: folder_name.clone(),
                                error: e.to_string(),
                            }),
                        }
                    }
                }
            }
        }

        // User records whose folder vanished are flagged, never auto-deleted.
        for (folder_name, _) in user_map {
            if !local_skills.contains_key(&folder_name) {
                info!("Skill {}: DB only (orphaned)", folder_name);
                result.removed.push(folder_name);
            }
        }

        Ok(result)
    }
}

/// Replace `dest` with a copy of `src`.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        manager: SkillManager,
        local_dir: PathBuf,
        staging_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local_dir = dir.path().join("workspace/.claude/skills");
        let staging_dir = dir.path().join("staging/skills");
        let db = Arc::new(Db::open(&dir.path().join("test.redb")).unwrap());
        let manager = SkillManager::new(db.clone(), local_dir.clone(), staging_dir.clone());
        Fixture {
            _dir: dir,
            db,
            manager,
            local_dir,
            staging_dir,
        }
    }

    fn demo_zip(skill_md: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("SKILL.md", options).unwrap();
            writer.write_all(skill_md.as_bytes()).unwrap();
            writer.start_file("helper.py", options).unwrap();
            writer.write_all(b"print('hi')\n").unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    fn wrapped_zip(skill_md: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("demo-main/SKILL.md", options).unwrap();
            writer.write_all(skill_md.as_bytes()).unwrap();
            writer.start_file("demo-main/scripts/run.sh", options).unwrap();
            writer.write_all(b"#!/bin/sh\n").unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_upload_package_creates_draft_record() {
        let f = fixture();
        let record = f
            .manager
            .upload_package(&demo_zip("# Demo\n\nA demo skill.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        assert!(record.has_draft);
        assert_eq!(record.current_version, 0);
        assert_eq!(record.folder_name, "demo");
        assert!(f.staging_dir.join("demo/draft/SKILL.md").exists());
        assert!(f.staging_dir.join("demo/draft/helper.py").exists());
        // The live mirror only appears at publish time.
        assert!(!f.local_dir.join("demo").exists());
    }

    #[tokio::test]
    async fn test_upload_flattens_single_root_folder() {
        let f = fixture();
        f.manager
            .upload_package(&wrapped_zip("# Demo\n\nWrapped.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        assert!(f.staging_dir.join("demo/draft/SKILL.md").exists());
        assert!(f.staging_dir.join("demo/draft/scripts/run.sh").exists());
    }

    #[tokio::test]
    async fn test_upload_without_skill_md_fails() {
        let f = fixture();
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("README.md", options).unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }
        let err = f
            .manager
            .upload_package(&buf, Some("bad"), "bad.zip")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_draft_lifecycle_publish_and_rollback() {
        let f = fixture();
        let record = f
            .manager
            .upload_package(&demo_zip("# Demo\n\nFirst.\n\nversion: 1.0.0\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();

        // Publish v1
        let (published, version) = f.manager.publish_draft(&record.id, Some("initial".into())).await.unwrap();
        assert_eq!(published.current_version, 1);
        assert!(!published.has_draft);
        assert_eq!(version.version, 1);
        assert!(f.local_dir.join("demo/SKILL.md").exists());
        assert!(f.staging_dir.join("demo/v1/SKILL.md").exists());
        assert!(!f.staging_dir.join("demo/draft").exists());

        let versions = f.manager.list_versions(&record.id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 1);

        // Publish without a new draft fails
        let err = f.manager.publish_draft(&record.id, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        // New draft, publish v2
        f.manager
            .upload_package(&demo_zip("# Demo\n\nSecond.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        let (published, _) = f.manager.publish_draft(&record.id, None).await.unwrap();
        assert_eq!(published.current_version, 2);
        let mirror_md = std::fs::read_to_string(f.local_dir.join("demo/SKILL.md")).unwrap();
        assert!(mirror_md.contains("Second"));

        // Rollback to v1: mirror content matches the v1 snapshot
        let rolled = f.manager.rollback(&record.id, 1).await.unwrap();
        assert_eq!(rolled.current_version, 1);
        assert!(!rolled.has_draft);
        let mirror_md = std::fs::read_to_string(f.local_dir.join("demo/SKILL.md")).unwrap();
        assert!(mirror_md.contains("First"));

        // Rolling back to the current version is idempotent
        let rolled = f.manager.rollback(&record.id, 1).await.unwrap();
        assert_eq!(rolled.current_version, 1);

        // Unknown version
        let err = f.manager.rollback(&record.id, 9).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rollback_discards_draft() {
        let f = fixture();
        let record = f
            .manager
            .upload_package(&demo_zip("# Demo\n\nV1.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        f.manager.publish_draft(&record.id, None).await.unwrap();
        f.manager
            .upload_package(&demo_zip("# Demo\n\nPending draft.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        assert!(f.staging_dir.join("demo/draft").exists());

        let rolled = f.manager.rollback(&record.id, 1).await.unwrap();
        assert!(!rolled.has_draft);
        assert!(!f.staging_dir.join("demo/draft").exists());
    }

    #[tokio::test]
    async fn test_discard_draft() {
        let f = fixture();
        let record = f
            .manager
            .upload_package(&demo_zip("# Demo\n\nDraft.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        let discarded = f.manager.discard_draft(&record.id).await.unwrap();
        assert!(!discarded.has_draft);
        assert!(!f.staging_dir.join("demo/draft").exists());

        let err = f.manager.discard_draft(&record.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_delete_cascades_versions_and_agent_refs() {
        let f = fixture();
        let record = f
            .manager
            .upload_package(&demo_zip("# Demo\n\nX.\n"), Some("demo"), "demo.zip")
            .await
            .unwrap();
        f.manager.publish_draft(&record.id, None).await.unwrap();

        let agent = f
            .db
            .put_agent(crate::db::AgentRecord {
                id: String::new(),
                name: "a".into(),
                description: None,
                instructions: None,
                model: None,
                permission_mode: Default::default(),
                allowed_tools: vec![],
                plugin_ids: vec![],
                skill_ids: vec![record.id.clone()],
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

        f.manager.delete(&record.id).await.unwrap();
        assert!(f.db.get_skill_opt(&record.id).unwrap().is_none());
        assert!(f.db.list_skill_versions(&record.id).unwrap().is_empty());
        assert!(!f.local_dir.join("demo").exists());
        assert!(!f.staging_dir.join("demo").exists());
        assert!(f.db.get_agent(&agent.id).unwrap().skill_ids.is_empty());
    }

    #[tokio::test]
    async fn test_delete_protects_system_skills() {
        let f = fixture();
        let record = f
            .db
            .put_skill(SkillRecord {
                id: String::new(),
                name: "sys".into(),
                description: String::new(),
                folder_name: "sys".into(),
                source_type: SkillSourceType::User,
                source_plugin_id: None,
                source_marketplace_id: None,
                local_path: None,
                version: None,
                current_version: 1,
                has_draft: false,
                is_system: true,
                created_by: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let err = f.manager.delete(&record.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_publish_rejects_plugin_skills() {
        let f = fixture();
        let record = f
            .db
            .put_skill(SkillRecord {
                id: String::new(),
                name: "from-plugin".into(),
                description: String::new(),
                folder_name: "from-plugin".into(),
                source_type: SkillSourceType::Plugin,
                source_plugin_id: Some("p1".into()),
                source_marketplace_id: None,
                local_path: None,
                version: None,
                current_version: 0,
                has_draft: true,
                is_system: false,
                created_by: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let err = f.manager.publish_draft(&record.id, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_refresh_adds_orphan_folders_and_flags_missing() {
        let f = fixture();
        // Orphan local folder
        let orphan = f.local_dir.join("orphan");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("SKILL.md"), "# Orphan\n\nFound on disk.\n").unwrap();
        // DB row with no folder
        f.db.put_skill(SkillRecord {
            id: String::new(),
            name: "gone".into(),
            description: String::new(),
            folder_name: "gone".into(),
            source_type: SkillSourceType::User,
            source_plugin_id: None,
            source_marketplace_id: None,
            local_path: None,
            version: None,
            current_version: 1,
            has_draft: false,
            is_system: false,
            created_by: None,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
        // Plugin skill must not be touched even without a folder
        f.db.put_skill(SkillRecord {
            id: String::new(),
            name: "plug".into(),
            description: String::new(),
            folder_name: "plug".into(),
            source_type: SkillSourceType::Plugin,
            source_plugin_id: Some("p1".into()),
            source_marketplace_id: None,
            local_path: None,
            version: None,
            current_version: 0,
            has_draft: false,
            is_system: false,
            created_by: None,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();

        let result = f.manager.refresh().await.unwrap();
        assert_eq!(result.added, vec!["orphan".to_string()]);
        assert_eq!(result.removed, vec!["gone".to_string()]);
        assert_eq!(result.total_local, 1);
        assert_eq!(result.total_plugins, 1);

        let added = f.db.find_skill_by_folder("orphan").unwrap().unwrap();
        assert_eq!(added.source_type, SkillSourceType::User);
        assert_eq!(added.created_by.as_deref(), Some("sync"));
        // The flagged record is not deleted
        assert!(f.db.find_skill_by_folder("gone").unwrap().is_some());
    }

    #[test]
    fn test_extract_metadata_heuristics() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("notes");
        std::fs::create_dir_all(&skill).unwrap();
        std::fs::write(
            skill.join("SKILL.md"),
            "# Note Taker\n\nTakes structured notes from meetings.\n\nVersion: 2.1.0\n",
        )
        .unwrap();
        let metadata = SkillManager::extract_metadata(&skill);
        assert_eq!(metadata.name, "Note Taker");
        assert_eq!(metadata.description, "Takes structured notes from meetings.");
        assert_eq!(metadata.version, "2.1.0");
    }

    #[test]
    fn test_extract_metadata_frontmatter_wins() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("fm");
        std::fs::create_dir_all(&skill).unwrap();
        std::fs::write(
            skill.join("SKILL.md"),
            "---\nname: pdf-tools\ndescription: Work with PDF files\nversion: 0.3.0\n---\n\n# Ignored Heading\n",
        )
        .unwrap();
        let metadata = SkillManager::extract_metadata(&skill);
        assert_eq!(metadata.name, "pdf-tools");
        assert_eq!(metadata.description, "Work with PDF files");
        assert_eq!(metadata.version, "0.3.0");
    }

    #[test]
    fn test_extract_metadata_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("empty-skill");
        std::fs::create_dir_all(&skill).unwrap();
        let metadata = SkillManager::extract_metadata(&skill);
        assert_eq!(metadata.name, "empty-skill");
        assert_eq!(metadata.version, "1.0.0");
    }
}

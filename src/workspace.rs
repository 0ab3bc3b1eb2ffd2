use crate::db::{Db, SkillRecord};
use crate::error::ServiceResult;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-agent workspace management for skill isolation.
///
/// Agent workspaces are created OUTSIDE the project tree so the model
/// agent's built-in skill discovery cannot walk into unauthorized sibling
/// directories. Each workspace holds only absolute symlinks to the skills
/// the agent is allowed to load:
///
/// ```text
/// {agents_root}/{agent_id}/.claude/skills/
///     pdf     -> ~/.claude/skills/pdf                    (plugin-installed)
///     my-tool -> {workspace}/.claude/skills/my-tool      (user-created)
/// ```
pub struct WorkspaceManager {
    /// `{workspace}/.claude/skills/`: user-created and promoted skills.
    main_skills_dir: PathBuf,
    /// Root of the isolated per-agent workspaces.
    agents_workspace: PathBuf,
    /// `~/.claude/skills/`: plugin-installed skills.
    plugin_skills_dir: PathBuf,
    db: Arc<Db>,
}

impl WorkspaceManager {
    pub fn new(
        main_skills_dir: PathBuf,
        agents_workspace: PathBuf,
        plugin_skills_dir: PathBuf,
        db: Arc<Db>,
    ) -> Self {
        Self {
            main_skills_dir,
            agents_workspace,
            plugin_skills_dir,
            db,
        }
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.main_skills_dir)?;
        std::fs::create_dir_all(&self.agents_workspace)?;
        Ok(())
    }

    /// Workspace path for an agent (handed to the model agent as cwd).
    pub fn agent_workspace(&self, agent_id: &str) -> PathBuf {
        self.agents_workspace.join(agent_id)
    }

    /// `{workspace}/{agent_id}/.claude/skills/`
    pub fn agent_skills_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_workspace(agent_id).join(".claude").join("skills")
    }

    pub fn workspace_exists(&self, agent_id: &str) -> bool {
        self.agent_workspace(agent_id).exists()
    }

    /// Resolve a skill's source directory, in priority order:
    /// 1. `record.local_path` when it exists on disk
    /// 2. the plugin skills root
    /// 3. the main (user) skills root
    pub fn resolve_skill_source(
        &self,
        skill_name: &str,
        record: Option<&SkillRecord>,
    ) -> Option<PathBuf> {
        if let Some(local_path) = record.and_then(|r| r.local_path.as_deref()) {
            let path = PathBuf::from(local_path);
            if path.exists() {
                debug!("Found skill at local_path: {}", path.display());
                return Some(path);
            }
        }

        let plugin_path = self.plugin_skills_dir.join(skill_name);
        if plugin_path.exists() {
            debug!("Found skill in plugin root: {}", plugin_path.display());
            return Some(plugin_path);
        }

        let workspace_path = self.main_skills_dir.join(skill_name);
        if workspace_path.exists() {
            debug!("Found skill in workspace root: {}", workspace_path.display());
            return Some(workspace_path);
        }

        None
    }

    /// All skill folder names across the plugin and workspace roots,
    /// deduplicated, restricted to directories containing `SKILL.md`.
    pub fn list_available_skills(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for root in [&self.plugin_skills_dir, &self.main_skills_dir] {
            let Ok(entries) = std::fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !path.is_dir() || name.starts_with('.') {
                    continue;
                }
                if path.join("SKILL.md").exists() {
                    names.insert(name.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    fn skill_name_by_id(&self, skill_id: &str) -> ServiceResult<Option<String>> {
        match self.db.get_skill_opt(skill_id)? {
            Some(skill) => Ok(Some(skill.folder_name)),
            None => {
                warn!("Skill not found: {}", skill_id);
                Ok(None)
            }
        }
    }

    /// The skill-name set the hook chain enforces at runtime.
    pub fn get_allowed_skill_names(
        &self,
        skill_ids: &[String],
        allow_all_skills: bool,
    ) -> ServiceResult<Vec<String>> {
        if allow_all_skills {
            return Ok(self.list_available_skills());
        }
        let mut names = Vec::new();
        for skill_id in skill_ids {
            if let Some(name) = self.skill_name_by_id(skill_id)? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Atomically rebuild an agent's skills directory: delete, recreate,
    /// then create one absolute symlink per authorized skill. Individual
    /// link failures are logged and skipped; the rebuild continues.
    pub fn rebuild_agent_workspace(
        &self,
        agent_id: &str,
        skill_ids: &[String],
        allow_all_skills: bool,
    ) -> ServiceResult<PathBuf> {
        self.ensure_dirs()?;

        let agent_workspace = self.agent_workspace(agent_id);
        let agent_skills_dir = self.agent_skills_dir(agent_id);

        if agent_skills_dir.exists() {
            std::fs::remove_dir_all(&agent_skills_dir)?;
        }
        std::fs::create_dir_all(&agent_skills_dir)?;

        let skill_names = if allow_all_skills {
            let names = self.list_available_skills();
            info!("Agent {}: linking ALL skills ({} skills)", agent_id, names.len());
            names
        } else {
            let mut names = Vec::new();
            for skill_id in skill_ids {
                match self.skill_name_by_id(skill_id)? {
                    Some(name) => names.push(name),
                    None => warn!("Could not resolve skill id to name: {}", skill_id),
                }
            }
            info!("Agent {}: linking {} skills: {:?}", agent_id, names.len(), names);
            names
        };

        let mut linked = 0usize;
        for skill_name in &skill_names {
            let record = self.db.find_skill_by_folder(skill_name)?;
            let Some(source) = self.resolve_skill_source(skill_name, record.as_ref()) else {
                warn!("Skill directory not found in any location: {}", skill_name);
                continue;
            };

            // Absolute targets: the link lives outside the project tree.
            let absolute_source = source.canonicalize().unwrap_or(source);
            let target = agent_skills_dir.join(skill_name);
            match std::os::unix::fs::symlink(&absolute_source, &target) {
                Ok(()) => {
                    linked += 1;
                    debug!("Created symlink: {} -> {}", target.display(), absolute_source.display());
                }
                Err(e) => {
                    warn!("Failed to create symlink for {}: {}", skill_name, e);
                }
            }
        }

        info!("Agent {} workspace rebuilt: {} skills linked", agent_id, linked);
        Ok(agent_workspace)
    }

    pub fn delete_agent_workspace(&self, agent_id: &str) -> ServiceResult<()> {
        let agent_workspace = self.agent_workspace(agent_id);
        if agent_workspace.exists() {
            std::fs::remove_dir_all(&agent_workspace)?;
            info!("Deleted workspace for agent {}", agent_id);
        } else {
            debug!("No workspace to delete for agent {}", agent_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SkillSourceType;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        manager: WorkspaceManager,
        main_skills: PathBuf,
        plugin_skills: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let main_skills = dir.path().join("workspace/.claude/skills");
        let plugin_skills = dir.path().join("claude-home/skills");
        let agents = dir.path().join("agent-workspaces");
        std::fs::create_dir_all(&main_skills).unwrap();
        std::fs::create_dir_all(&plugin_skills).unwrap();
        let db = Arc::new(Db::open(&dir.path().join("test.redb")).unwrap());
        let manager = WorkspaceManager::new(
            main_skills.clone(),
            agents,
            plugin_skills.clone(),
            db.clone(),
        );
        Fixture {
            _dir: dir,
            db,
            manager,
            main_skills,
            plugin_skills,
        }
    }

    fn make_skill_dir(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), format!("# {name}\n\nA test skill.\n")).unwrap();
    }

    fn register_skill(db: &Db, folder: &str) -> SkillRecord {
        db.put_skill(SkillRecord {
            id: String::new(),
            name: folder.to_string(),
            description: String::new(),
            folder_name: folder.to_string(),
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
        .unwrap()
    }

    #[test]
    fn test_list_available_skills_dedup_and_filter() {
        let f = fixture();
        make_skill_dir(&f.main_skills, "alpha");
        make_skill_dir(&f.plugin_skills, "alpha");
        make_skill_dir(&f.plugin_skills, "beta");
        // Directory without SKILL.md is excluded
        std::fs::create_dir_all(f.main_skills.join("not-a-skill")).unwrap();
        // Hidden directories are excluded
        make_skill_dir(&f.plugin_skills, ".hidden");

        let names = f.manager.list_available_skills();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_resolve_priority_local_path_first() {
        let f = fixture();
        make_skill_dir(&f.main_skills, "gamma");
        make_skill_dir(&f.plugin_skills, "gamma");

        // local_path wins when set and present
        let local = f._dir.path().join("elsewhere/gamma");
        std::fs::create_dir_all(&local).unwrap();
        let mut record = register_skill(&f.db, "gamma");
        record.local_path = Some(local.display().to_string());

        let resolved = f.manager.resolve_skill_source("gamma", Some(&record)).unwrap();
        assert_eq!(resolved, local);

        // Missing local_path falls through to the plugin root
        record.local_path = Some("/nonexistent/gamma".to_string());
        let resolved = f.manager.resolve_skill_source("gamma", Some(&record)).unwrap();
        assert_eq!(resolved, f.plugin_skills.join("gamma"));

        // No record at all: plugin root, then workspace root
        let resolved = f.manager.resolve_skill_source("gamma", None).unwrap();
        assert_eq!(resolved, f.plugin_skills.join("gamma"));
        std::fs::remove_dir_all(f.plugin_skills.join("gamma")).unwrap();
        let resolved = f.manager.resolve_skill_source("gamma", None).unwrap();
        assert_eq!(resolved, f.main_skills.join("gamma"));
    }

    #[test]
    fn test_rebuild_links_only_allowed_skills() {
        let f = fixture();
        make_skill_dir(&f.main_skills, "allowed");
        make_skill_dir(&f.main_skills, "forbidden");
        let allowed = register_skill(&f.db, "allowed");
        register_skill(&f.db, "forbidden");

        let workspace = f
            .manager
            .rebuild_agent_workspace("agent-1", &[allowed.id.clone()], false)
            .unwrap();
        assert_eq!(workspace, f.manager.agent_workspace("agent-1"));

        let skills_dir = f.manager.agent_skills_dir("agent-1");
        let entries: Vec<String> = std::fs::read_dir(&skills_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["allowed".to_string()]);

        // Every entry is an absolute symlink to an existing SKILL.md dir
        for entry in &entries {
            let link = skills_dir.join(entry);
            let meta = std::fs::symlink_metadata(&link).unwrap();
            assert!(meta.file_type().is_symlink());
            let target = std::fs::read_link(&link).unwrap();
            assert!(target.is_absolute());
            assert!(target.join("SKILL.md").exists());
        }

        let allowed_names = f
            .manager
            .get_allowed_skill_names(&[allowed.id], false)
            .unwrap();
        assert_eq!(allowed_names, vec!["allowed".to_string()]);
    }

    #[test]
    fn test_rebuild_allow_all_links_everything() {
        let f = fixture();
        make_skill_dir(&f.main_skills, "one");
        make_skill_dir(&f.plugin_skills, "two");

        f.manager.rebuild_agent_workspace("agent-2", &[], true).unwrap();
        let skills_dir = f.manager.agent_skills_dir("agent-2");
        let mut entries: Vec<String> = std::fs::read_dir(&skills_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_rebuild_is_atomic_replacement() {
        let f = fixture();
        make_skill_dir(&f.main_skills, "keep");
        make_skill_dir(&f.main_skills, "drop");
        let keep = register_skill(&f.db, "keep");
        let drop_skill = register_skill(&f.db, "drop");

        f.manager
            .rebuild_agent_workspace("agent-3", &[keep.id.clone(), drop_skill.id], false)
            .unwrap();
        // Second rebuild with a smaller set removes the old link
        f.manager
            .rebuild_agent_workspace("agent-3", &[keep.id], false)
            .unwrap();

        let skills_dir = f.manager.agent_skills_dir("agent-3");
        let entries: Vec<String> = std::fs::read_dir(&skills_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["keep".to_string()]);
    }

    #[test]
    fn test_missing_source_is_skipped_not_fatal() {
        let f = fixture();
        let ghost = register_skill(&f.db, "ghost");
        // No directory anywhere for "ghost"
        f.manager
            .rebuild_agent_workspace("agent-4", &[ghost.id], false)
            .unwrap();
        let entries = std::fs::read_dir(f.manager.agent_skills_dir("agent-4"))
            .unwrap()
            .count();
        assert_eq!(entries, 0);
    }

    #[test]
    fn test_delete_agent_workspace() {
        let f = fixture();
        f.manager.rebuild_agent_workspace("agent-5", &[], false).unwrap();
        assert!(f.manager.workspace_exists("agent-5"));
        f.manager.delete_agent_workspace("agent-5").unwrap();
        assert!(!f.manager.workspace_exists("agent-5"));
        // Deleting again is a no-op
        f.manager.delete_agent_workspace("agent-5").unwrap();
    }
}

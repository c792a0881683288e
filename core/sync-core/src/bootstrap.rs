//! Project selection at startup and on project switches.
//!
//! Loading first pulls the user's stored preferences from the server into
//! [`Preferences`], then picks a project. Fallback order for the default project:
//!
//! 1. The project id remembered in the session, if it is still active.
//! 2. The user's default-project preference, if active. A stale preference
//!    is cleared.
//! 3. The first project of the loaded (active) list.
//! 4. Administrators only: the first active project of a fresh, unfiltered
//!    project list.
//! 5. Nothing: the session project is cleared and the caller shows the
//!    project-less landing page.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError, SyncError};
use crate::resource::{ResourceRef, STATE_ACTIVE};
use crate::session::{
    Preferences, SessionStore, PREF_PROJECT_DEFAULT, SESSION_ACCOUNT_ID, SESSION_PROJECT,
    SESSION_USER_TYPE, USER_TYPE_ADMIN,
};
use crate::store::{FindOptions, Store};

pub const PROJECT_KIND: &str = "project";
pub const PREFERENCE_KIND: &str = "userpreference";

#[derive(Debug, Clone)]
pub enum Selection {
    Project(ResourceRef),
    /// No usable project; route to the landing page.
    NoProject,
}

impl Selection {
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Selection::Project(project) => Some(project.id()),
            Selection::NoProject => None,
        }
    }
}

pub struct ProjectSelector {
    store: Arc<dyn Store>,
    session: Arc<dyn SessionStore>,
    prefs: Arc<dyn Preferences>,
    auth_enabled: bool,
    is_admin: bool,
    projects: Vec<ResourceRef>,
}

impl ProjectSelector {
    pub fn new(
        store: Arc<dyn Store>,
        session: Arc<dyn SessionStore>,
        prefs: Arc<dyn Preferences>,
        auth_enabled: bool,
    ) -> Self {
        Self {
            store,
            session,
            prefs,
            auth_enabled,
            is_admin: !auth_enabled,
            projects: Vec::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Active projects from the last load or refresh.
    pub fn projects(&self) -> &[ResourceRef] {
        &self.projects
    }

    /// Remembers which account the server says is logged in.
    pub fn record_account(&self, account_id: Option<&str>) {
        debug!(account = ?account_id, "Recording account");
        self.session.set(SESSION_ACCOUNT_ID, account_id);
    }

    /// Loads the user's projects and selects the default one.
    pub async fn load(&mut self) -> Result<Selection> {
        let user_type = self.session.get(SESSION_USER_TYPE);
        self.is_admin = user_type.as_deref() == Some(USER_TYPE_ADMIN) || !self.auth_enabled;
        debug!(is_admin = self.is_admin, "Loading projects");

        self.load_preferences().await?;
        self.projects = self.find_active_projects().await?;
        let projects = self.projects.clone();
        self.select_default_project(&projects).await
    }

    /// Copies every server-side `{name, value}` preference record into the
    /// local preferences. Returns how many were applied.
    pub async fn load_preferences(&self) -> Result<usize> {
        let records = match self
            .store
            .find_all(PREFERENCE_KIND, &FindOptions::reload())
            .await
        {
            Ok(records) => records,
            Err(err) => {
                self.surface_auth(err)?;
                return Ok(0);
            }
        };

        let mut applied = 0;
        for record in records {
            let resource = record.read();
            let Some(name) = resource.field("name").and_then(Value::as_str) else {
                continue;
            };
            let value = match resource.field("value") {
                Some(Value::String(value)) => value.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            self.prefs.set(name, &value);
            applied += 1;
        }
        debug!(applied, "Loaded preferences");
        Ok(applied)
    }

    /// Re-fetches the project list and selects again.
    pub async fn refresh_projects(&mut self) -> Result<Selection> {
        self.projects = self.find_active_projects().await?;
        let projects = self.projects.clone();
        self.select_default_project(&projects).await
    }

    /// Switches the session to `project_id`, dropping everything cached for
    /// the previous project. Reconcile steps still in flight for it see the
    /// store generation change and do nothing. An empty id falls back to
    /// default selection.
    pub async fn switch_project(
        &mut self,
        project_id: Option<&str>,
    ) -> Result<Option<Selection>> {
        let project_id = project_id.filter(|id| !id.is_empty());
        info!(project = ?project_id, "Switching project");
        self.session.set(SESSION_PROJECT, project_id);
        self.store.reset();

        if project_id.is_some() {
            return Ok(None);
        }
        let projects = self.projects.clone();
        self.select_default_project(&projects).await.map(Some)
    }

    pub async fn select_default_project(&self, active: &[ResourceRef]) -> Result<Selection> {
        if let Some(project) = self
            .active_project_from_id(self.session.get(SESSION_PROJECT).as_deref())
            .await?
        {
            return Ok(self.select(project, false));
        }

        if let Some(project) = self
            .active_project_from_id(self.prefs.get(PREF_PROJECT_DEFAULT).as_deref())
            .await?
        {
            return Ok(self.select(project, false));
        }
        self.prefs.set(PREF_PROJECT_DEFAULT, "");

        if let Some(project) = active.first() {
            return Ok(self.select(project.clone(), true));
        }

        if self.is_admin {
            match self.find_all_projects().await {
                Ok(all) => {
                    if let Some(project) = all.into_iter().find(is_active) {
                        return Ok(self.select(project, true));
                    }
                }
                Err(err) => self.surface_auth(err)?,
            }
        }

        warn!("No active project available");
        self.session.set(SESSION_PROJECT, None);
        Ok(Selection::NoProject)
    }

    fn select(&self, project: ResourceRef, overwrite_default: bool) -> Selection {
        info!(project = %project.id(), "Selected project");
        self.session.set(SESSION_PROJECT, Some(project.id()));
        if overwrite_default || self.prefs.get(PREF_PROJECT_DEFAULT).is_none() {
            self.prefs.set(PREF_PROJECT_DEFAULT, project.id());
        }
        Selection::Project(project)
    }

    async fn active_project_from_id(
        &self,
        project_id: Option<&str>,
    ) -> Result<Option<ResourceRef>> {
        let Some(project_id) = project_id else {
            return Ok(None);
        };

        match self.store.find(PROJECT_KIND, project_id).await {
            Ok(project) if is_active(&project) => Ok(Some(project)),
            Ok(_) => {
                debug!(project = %project_id, "Project is not active");
                Ok(None)
            }
            Err(err) => {
                self.surface_auth(err)?;
                Ok(None)
            }
        }
    }

    async fn find_active_projects(&self) -> Result<Vec<ResourceRef>> {
        match self.find_all_projects().await {
            Ok(all) => Ok(all.into_iter().filter(is_active).collect()),
            Err(err) if err.is_auth() && !self.auth_enabled => Err(SyncError::Store(err)),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_all_projects(&self) -> std::result::Result<Vec<ResourceRef>, StoreError> {
        let mut options = FindOptions::reload();
        if !self.auth_enabled {
            options = options.with_filter("all", "true");
        }
        self.store.find_all(PROJECT_KIND, &options).await
    }

    /// Lookup failures are fallthroughs, except a rejected login.
    fn surface_auth(&self, err: StoreError) -> Result<()> {
        if err.is_auth() && self.auth_enabled {
            return Err(err.into());
        }
        debug!(error = %err, "Lookup failed; falling through");
        Ok(())
    }
}

fn is_active(project: &ResourceRef) -> bool {
    project.state().as_deref() == Some(STATE_ACTIVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryPreferences, MemorySession};
    use crate::store::MemoryStore;
    use serde_json::{json, Map, Value};

    struct Fixture {
        store: Arc<MemoryStore>,
        session: Arc<MemorySession>,
        prefs: Arc<MemoryPreferences>,
    }

    impl Fixture {
        fn new(projects: &[(&str, &str)]) -> Self {
            let store = Arc::new(MemoryStore::new());
            for (id, state) in projects {
                store.insert_remote(project(id, state));
            }
            Self {
                store,
                session: Arc::new(MemorySession::new()),
                prefs: Arc::new(MemoryPreferences::new()),
            }
        }

        fn selector(&self, auth_enabled: bool) -> ProjectSelector {
            ProjectSelector::new(
                self.store.clone(),
                self.session.clone(),
                self.prefs.clone(),
                auth_enabled,
            )
        }
    }

    fn project(id: &str, state: &str) -> Map<String, Value> {
        match json!({"type": "project", "id": id, "state": state}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn session_project_wins_when_active() {
        let fixture = Fixture::new(&[("1a5", "active"), ("1a7", "active")]);
        fixture.session.set(SESSION_PROJECT, Some("1a7"));

        let selection = fixture.selector(true).load().await.expect("load");
        assert_eq!(selection.project_id(), Some("1a7"));
        assert_eq!(fixture.prefs.get(PREF_PROJECT_DEFAULT).as_deref(), Some("1a7"));
    }

    #[tokio::test]
    async fn default_preference_is_kept_when_not_overwriting() {
        let fixture = Fixture::new(&[("1a5", "active"), ("1a7", "active")]);
        fixture.session.set(SESSION_PROJECT, Some("1a5"));
        fixture.prefs.set(PREF_PROJECT_DEFAULT, "1a7");

        let selection = fixture.selector(true).load().await.expect("load");
        assert_eq!(selection.project_id(), Some("1a5"));
        assert_eq!(fixture.prefs.get(PREF_PROJECT_DEFAULT).as_deref(), Some("1a7"));
    }

    #[tokio::test]
    async fn inactive_session_project_falls_back_to_preference() {
        let fixture = Fixture::new(&[("1a5", "inactive"), ("1a7", "active")]);
        fixture.session.set(SESSION_PROJECT, Some("1a5"));
        fixture.prefs.set(PREF_PROJECT_DEFAULT, "1a7");

        let selection = fixture.selector(true).load().await.expect("load");
        assert_eq!(selection.project_id(), Some("1a7"));
        assert_eq!(fixture.session.get(SESSION_PROJECT).as_deref(), Some("1a7"));
    }

    #[tokio::test]
    async fn stale_preference_is_replaced_by_first_active() {
        let fixture = Fixture::new(&[("1a3", "removed"), ("1a5", "active"), ("1a7", "active")]);
        fixture.prefs.set(PREF_PROJECT_DEFAULT, "1a3");

        let mut selector = fixture.selector(true);
        let selection = selector.load().await.expect("load");
        assert_eq!(selector.projects().len(), 2);
        assert_eq!(selection.project_id(), Some("1a5"));
        assert_eq!(fixture.prefs.get(PREF_PROJECT_DEFAULT).as_deref(), Some("1a5"));
    }

    #[tokio::test]
    async fn admin_refetches_when_loaded_list_is_empty() {
        let fixture = Fixture::new(&[("1a5", "inactive")]);
        fixture.session.set(SESSION_USER_TYPE, Some(USER_TYPE_ADMIN));

        let mut selector = fixture.selector(true);
        assert!(matches!(
            selector.load().await.expect("load"),
            Selection::NoProject
        ));
        assert!(selector.is_admin());

        fixture.store.insert_remote(project("1a9", "active"));
        let selection = selector.select_default_project(&[]).await.expect("select");
        assert_eq!(selection.project_id(), Some("1a9"));
        assert_eq!(fixture.session.get(SESSION_PROJECT).as_deref(), Some("1a9"));
        assert_eq!(fixture.prefs.get(PREF_PROJECT_DEFAULT).as_deref(), Some("1a9"));
    }

    #[tokio::test]
    async fn non_admin_gets_no_project() {
        let fixture = Fixture::new(&[("1a5", "inactive")]);
        fixture.session.set(SESSION_USER_TYPE, Some("user"));
        fixture.session.set(SESSION_PROJECT, Some("1a5"));

        let mut selector = fixture.selector(true);
        selector.load().await.expect("load");
        assert!(!selector.is_admin());

        fixture.store.insert_remote(project("1a9", "active"));
        let selection = selector.select_default_project(&[]).await.expect("select");
        assert!(matches!(selection, Selection::NoProject));
        assert_eq!(fixture.session.get(SESSION_PROJECT), None);
        assert_eq!(fixture.prefs.get(PREF_PROJECT_DEFAULT), None);
    }

    #[tokio::test]
    async fn admin_with_nothing_active_gets_no_project() {
        let fixture = Fixture::new(&[("1a5", "inactive")]);
        let selection = fixture.selector(false).load().await.expect("load");
        assert!(matches!(selection, Selection::NoProject));
    }

    #[tokio::test]
    async fn rejected_login_surfaces_as_auth_error() {
        let fixture = Fixture::new(&[("1a5", "active")]);
        fixture
            .store
            .fail_kind(PROJECT_KIND, StoreError::Unauthorized { status: 401 });

        let err = fixture.selector(true).load().await.expect_err("auth");
        assert!(matches!(err, SyncError::Auth { status: 401 }));

        let err = fixture.selector(false).load().await.expect_err("store");
        assert!(matches!(err, SyncError::Store(_)));
    }

    #[tokio::test]
    async fn server_preferences_pick_the_default_project() {
        let fixture = Fixture::new(&[("1a5", "active"), ("1a7", "active")]);
        fixture.store.insert_remote(match json!({
            "type": "userpreference",
            "id": "1up1",
            "name": PREF_PROJECT_DEFAULT,
            "value": "1a7",
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        });

        let selection = fixture.selector(true).load().await.expect("load");
        assert_eq!(selection.project_id(), Some("1a7"));
        assert_eq!(fixture.session.get(SESSION_PROJECT).as_deref(), Some("1a7"));
    }

    #[tokio::test]
    async fn preference_lookup_failures_only_stop_on_auth() {
        let fixture = Fixture::new(&[("1a5", "active")]);
        fixture.store.fail_kind(
            PREFERENCE_KIND,
            StoreError::Http {
                status: 404,
                message: "no such type".to_string(),
            },
        );
        let selector = fixture.selector(true);
        assert_eq!(selector.load_preferences().await.expect("fallthrough"), 0);

        fixture
            .store
            .fail_kind(PREFERENCE_KIND, StoreError::Unauthorized { status: 401 });
        let err = fixture.selector(true).load().await.expect_err("auth");
        assert!(matches!(err, SyncError::Auth { status: 401 }));
    }

    #[test]
    fn account_id_lands_in_session() {
        let fixture = Fixture::new(&[]);
        let selector = fixture.selector(true);
        selector.record_account(Some("1a1"));
        assert_eq!(fixture.session.get(SESSION_ACCOUNT_ID).as_deref(), Some("1a1"));
        selector.record_account(None);
        assert_eq!(fixture.session.get(SESSION_ACCOUNT_ID), None);
    }

    #[tokio::test]
    async fn auth_disabled_means_admin() {
        let fixture = Fixture::new(&[("1a5", "active")]);
        let mut selector = fixture.selector(false);
        let selection = selector.load().await.expect("load");
        assert!(selector.is_admin());
        assert_eq!(selection.project_id(), Some("1a5"));
    }

    #[tokio::test]
    async fn switching_resets_cache_and_reselects_on_empty_id() {
        let fixture = Fixture::new(&[("1a5", "active"), ("1a7", "active")]);
        let mut selector = fixture.selector(true);
        selector.load().await.expect("load");
        assert!(fixture.store.cached_count() > 0);

        let switched = selector.switch_project(Some("1a7")).await.expect("switch");
        assert!(switched.is_none());
        assert_eq!(fixture.store.cached_count(), 0);
        assert_eq!(fixture.session.get(SESSION_PROJECT).as_deref(), Some("1a7"));

        let reselected = selector
            .switch_project(Some(""))
            .await
            .expect("switch")
            .expect("reselected");
        assert_eq!(reselected.project_id(), Some("1a5"));
    }

    #[tokio::test]
    async fn refresh_picks_up_new_projects() {
        let fixture = Fixture::new(&[]);
        fixture.session.set(SESSION_USER_TYPE, Some("user"));
        let mut selector = fixture.selector(true);
        assert!(matches!(
            selector.load().await.expect("load"),
            Selection::NoProject
        ));

        fixture.store.insert_remote(project("1a5", "active"));
        let selection = selector.refresh_projects().await.expect("refresh");
        assert_eq!(selection.project_id(), Some("1a5"));
    }
}

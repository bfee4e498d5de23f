use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::index::{
    BackupEntry, EntryIdentity, Location, OpType, SelectionType, SubjectDetail, SubjectKind,
};

pub const SORT_KEYS: usize = 3;
pub const FLAG_FACETS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Overview,
    BatchBackup,
    BatchRestore,
}

impl Mode {
    /// Which entries the mode shows (and lets the user act on).
    pub fn op_type(&self) -> OpType {
        match self {
            Mode::Overview | Mode::BatchBackup => OpType::Backup,
            Mode::BatchRestore => OpType::Restore,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Overview => "overview",
            Mode::BatchBackup => "batch_backup",
            Mode::BatchRestore => "batch_restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overview" => Some(Mode::Overview),
            "batch_backup" | "backup" => Some(Mode::BatchBackup),
            "batch_restore" | "restore" => Some(Mode::BatchRestore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" | "ascending" => Some(SortOrder::Ascending),
            "desc" | "descending" => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Intent {
    SetMode(Mode),
    FilterByKey(String),
    FilterByFlag(usize),
    FilterByLocation(usize),
    SetUserIdIndexList(Vec<usize>),
    Sort { index: usize, order: SortOrder },
    Select(EntryIdentity),
    SelectAll,
    DeleteSelected,
    Process(SelectionType),
    OnRefresh,
}

/// Side effects the engine asks its shell to run. The engine itself never
/// touches the catalog or the filesystem.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Refresh,
    DeleteThenRefresh(Vec<EntryIdentity>),
    Process {
        selection: SelectionType,
        identities: Vec<EntryIdentity>,
    },
}

#[derive(Debug)]
pub struct Applied {
    pub changed: bool,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRow {
    pub identity: EntryIdentity,
    pub title: String,
    pub subject_id: String,
    pub user_id: Option<u32>,
    pub preserve_id: i64,
    pub size_bytes: u64,
    pub size_display: String,
    pub backups_count: u64,
    pub selected: bool,
    pub detail: SubjectDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListView {
    pub kind: SubjectKind,
    pub mode: Mode,
    pub rows: Vec<EntryRow>,
    pub locations: Vec<String>,
    pub location_index: usize,
    pub filter_key: String,
    pub flag_index: usize,
    pub user_id_domain: Vec<u32>,
    pub user_id_indices: Vec<usize>,
    pub sort_index: usize,
    pub sort_order: SortOrder,
    pub activated_count: usize,
    pub refreshing: bool,
    pub processing: bool,
    pub notice: Option<String>,
}

/// Selection/filter/sort state machine over one subject kind. Intents are
/// applied synchronously by a single owner; invalid intents are clamped or
/// ignored, never errors. The derived view is always fully recomputed.
pub struct ListEngine {
    kind: SubjectKind,
    snapshot: Vec<BackupEntry>,
    accounts: Vec<String>,
    user_id_domain: Vec<u32>,
    mode: Mode,
    location_index: usize,
    filter_key: String,
    flag_index: usize,
    user_id_indices: Vec<usize>,
    sort_index: usize,
    sort_order: SortOrder,
    activated: HashSet<EntryIdentity>,
    refreshing: bool,
    processing: bool,
    notice: Option<String>,
    view: ListView,
}

impl ListEngine {
    pub fn new(kind: SubjectKind) -> Self {
        let mut engine = Self {
            kind,
            snapshot: Vec::new(),
            accounts: Vec::new(),
            user_id_domain: Vec::new(),
            mode: Mode::Overview,
            location_index: 0,
            filter_key: String::new(),
            flag_index: 0,
            user_id_indices: Vec::new(),
            sort_index: 0,
            sort_order: SortOrder::Ascending,
            activated: HashSet::new(),
            refreshing: false,
            processing: false,
            notice: None,
            view: ListView {
                kind,
                mode: Mode::Overview,
                rows: Vec::new(),
                locations: vec!["Local".to_string()],
                location_index: 0,
                filter_key: String::new(),
                flag_index: 0,
                user_id_domain: Vec::new(),
                user_id_indices: Vec::new(),
                sort_index: 0,
                sort_order: SortOrder::Ascending,
                activated_count: 0,
                refreshing: false,
                processing: false,
                notice: None,
            },
        };
        engine.recompute();
        engine
    }

    pub fn view(&self) -> &ListView {
        &self.view
    }

    pub fn apply(&mut self, intent: Intent) -> Applied {
        debug!(event = "engine.intent", intent = ?intent, "engine.intent");
        let before = self.view.clone();
        let mut commands = Vec::new();

        match intent {
            Intent::SetMode(mode) => {
                // Leaving a batch mode abandons its selection; the other
                // mode shows a different op's rows.
                if self.mode != mode && self.mode != Mode::Overview {
                    self.activated.clear();
                }
                self.mode = mode;
            }
            Intent::FilterByKey(text) => {
                self.filter_key = text;
            }
            Intent::FilterByFlag(index) => {
                if index < FLAG_FACETS {
                    self.flag_index = index;
                }
            }
            Intent::FilterByLocation(index) => {
                if index <= self.accounts.len() {
                    self.location_index = index;
                }
            }
            Intent::SetUserIdIndexList(list) => {
                let mut valid: Vec<usize> = list
                    .into_iter()
                    .filter(|i| *i < self.user_id_domain.len())
                    .collect();
                valid.sort_unstable();
                valid.dedup();
                if !valid.is_empty() {
                    self.user_id_indices = valid;
                }
            }
            Intent::Sort { index, order } => {
                if index < SORT_KEYS {
                    self.sort_index = index;
                    self.sort_order = order;
                }
            }
            Intent::Select(identity) => {
                if self.mode != Mode::Overview
                    && !self.busy()
                    && self.snapshot.iter().any(|e| e.identity() == identity)
                {
                    if !self.activated.remove(&identity) {
                        self.activated.insert(identity);
                    }
                }
            }
            Intent::SelectAll => {
                if self.mode != Mode::Overview && !self.busy() {
                    let visible: Vec<EntryIdentity> =
                        self.view.rows.iter().map(|r| r.identity.clone()).collect();
                    if !visible.is_empty() {
                        if visible.iter().all(|id| self.activated.contains(id)) {
                            self.activated.clear();
                        } else {
                            self.activated.extend(visible);
                        }
                    }
                }
            }
            Intent::DeleteSelected => {
                if self.mode == Mode::BatchRestore && !self.activated.is_empty() && !self.busy() {
                    let identities = self.activated_ordered();
                    self.activated.clear();
                    self.refreshing = true;
                    commands.push(Command::DeleteThenRefresh(identities));
                }
            }
            Intent::Process(selection) => {
                if !self.activated.is_empty() && !self.busy() {
                    let identities = self.activated_ordered();
                    self.processing = true;
                    commands.push(Command::Process {
                        selection,
                        identities,
                    });
                }
            }
            Intent::OnRefresh => {
                // A refresh already in flight coalesces the request.
                if !self.refreshing {
                    self.refreshing = true;
                    commands.push(Command::Refresh);
                }
            }
        }

        self.recompute();
        Applied {
            changed: self.view != before || !commands.is_empty(),
            commands,
        }
    }

    /// Installs a freshly scanned snapshot: prunes the selection down to
    /// identities that still exist, refreshes the user-id facet domain, and
    /// ends the refresh latch. The recompute uses whatever filter/sort
    /// parameters are current now, not those at refresh submission.
    pub fn install_snapshot(
        &mut self,
        entries: Vec<BackupEntry>,
        user_ids: Vec<u32>,
        notice: Option<String>,
    ) {
        let identities: HashSet<EntryIdentity> =
            entries.iter().map(BackupEntry::identity).collect();
        self.activated.retain(|id| identities.contains(id));
        self.snapshot = entries;
        self.user_id_domain = user_ids;
        self.user_id_indices
            .retain(|i| *i < self.user_id_domain.len());
        self.refreshing = false;
        self.notice = notice;
        self.recompute();
    }

    pub fn refresh_failed(&mut self, message: String) {
        self.refreshing = false;
        self.notice = Some(message);
        self.recompute();
    }

    pub fn batch_done(&mut self, error: Option<String>) {
        self.processing = false;
        self.notice = error;
        self.recompute();
    }

    /// Registry changed: update the location facet. An out-of-range
    /// location selection falls back to local.
    pub fn set_accounts(&mut self, accounts: Vec<String>) {
        self.accounts = accounts;
        if self.location_index > self.accounts.len() {
            self.location_index = 0;
        }
        self.recompute();
    }

    fn busy(&self) -> bool {
        self.refreshing || self.processing
    }

    fn activated_ordered(&self) -> Vec<EntryIdentity> {
        let mut identities: Vec<EntryIdentity> = self.activated.iter().cloned().collect();
        identities.sort_by_key(|id| id.to_string());
        identities
    }

    fn resolved_location(&self) -> Location {
        if self.location_index == 0 {
            Location::Local
        } else {
            match self.accounts.get(self.location_index - 1) {
                Some(name) => Location::Remote(name.clone()),
                None => Location::Local,
            }
        }
    }

    fn recompute(&mut self) {
        let location = self.resolved_location();
        let key_lower = self.filter_key.to_lowercase();
        let selected_users: Option<HashSet<u32>> = if self.user_id_indices.is_empty() {
            None
        } else {
            Some(
                self.user_id_indices
                    .iter()
                    .filter_map(|i| self.user_id_domain.get(*i).copied())
                    .collect(),
            )
        };

        let filtered: Vec<&BackupEntry> = self
            .snapshot
            .iter()
            .filter(|e| e.kind() == self.kind)
            .filter(|e| e.location == location)
            .filter(|e| {
                key_lower.is_empty() || e.subject_id.to_lowercase().contains(&key_lower)
            })
            .filter(|e| flag_passes(self.flag_index, e))
            .filter(|e| match (&selected_users, e.user_id) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(users), Some(user_id)) => users.contains(&user_id),
            })
            .collect();

        // Snapshot count per subject: its restore entries in the filtered
        // population. Backup rows show the history excluding the slot they
        // would overwrite.
        let mut counts: HashMap<(&str, Option<u32>), u64> = HashMap::new();
        for e in &filtered {
            if e.op_type == OpType::Restore {
                *counts
                    .entry((e.subject_id.as_str(), e.user_id))
                    .or_insert(0) += 1;
            }
        }

        let op = self.mode.op_type();
        let mut rows: Vec<EntryRow> = filtered
            .iter()
            .filter(|e| e.op_type == op)
            .map(|e| {
                let snapshots = counts
                    .get(&(e.subject_id.as_str(), e.user_id))
                    .copied()
                    .unwrap_or(0);
                let backups_count = match e.op_type {
                    OpType::Backup => snapshots.saturating_sub(1),
                    OpType::Restore => snapshots,
                };
                let identity = e.identity();
                let selected = self.activated.contains(&identity);
                EntryRow {
                    identity,
                    title: e.title().to_string(),
                    subject_id: e.subject_id.clone(),
                    user_id: e.user_id,
                    preserve_id: e.preserve_id,
                    size_bytes: e.size_bytes,
                    size_display: e.size_display.clone(),
                    backups_count,
                    selected,
                    detail: e.detail.clone(),
                }
            })
            .collect();

        let sort_index = self.sort_index;
        let sort_order = self.sort_order;
        rows.sort_by(|a, b| {
            let primary = match sort_index {
                1 => a.size_bytes.cmp(&b.size_bytes),
                2 => a.preserve_id.cmp(&b.preserve_id),
                _ => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            };
            let primary = match sort_order {
                SortOrder::Ascending => primary,
                SortOrder::Descending => primary.reverse(),
            };
            primary.then_with(|| a.subject_id.cmp(&b.subject_id))
        });

        let mut locations = Vec::with_capacity(self.accounts.len() + 1);
        locations.push("Local".to_string());
        locations.extend(self.accounts.iter().cloned());

        self.view = ListView {
            kind: self.kind,
            mode: self.mode,
            rows,
            locations,
            location_index: self.location_index,
            filter_key: self.filter_key.clone(),
            flag_index: self.flag_index,
            user_id_domain: self.user_id_domain.clone(),
            user_id_indices: self.user_id_indices.clone(),
            sort_index: self.sort_index,
            sort_order: self.sort_order,
            activated_count: self.activated.len(),
            refreshing: self.refreshing,
            processing: self.processing,
            notice: self.notice.clone(),
        };
    }
}

fn flag_passes(flag_index: usize, entry: &BackupEntry) -> bool {
    match (&entry.detail, flag_index) {
        (SubjectDetail::Media { .. }, _) => true,
        (detail, 1) => detail.is_system_app(),
        (detail, 2) => !detail.is_system_app(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(
        subject: &str,
        op: OpType,
        user: u32,
        preserve: i64,
        location: Location,
        size: u64,
        system: bool,
    ) -> BackupEntry {
        BackupEntry {
            subject_id: subject.to_string(),
            op_type: op,
            user_id: Some(user),
            preserve_id: preserve,
            location,
            backup_dir: format!("/b/{subject}/{user}/{preserve}"),
            size_bytes: size,
            size_display: format!("{size} B"),
            detail: SubjectDetail::Package {
                label: subject.to_string(),
                version: "1.0".to_string(),
                system_app: system,
                has_keystore: false,
                ssaid: String::new(),
                installed: true,
            },
            created_at: None,
        }
    }

    fn media(subject: &str, op: OpType, preserve: i64) -> BackupEntry {
        BackupEntry {
            subject_id: subject.to_string(),
            op_type: op,
            user_id: None,
            preserve_id: preserve,
            location: Location::Local,
            backup_dir: format!("/m/{subject}/{preserve}"),
            size_bytes: 10,
            size_display: "10 B".to_string(),
            detail: SubjectDetail::Media {
                path: format!("/sdcard/{subject}"),
            },
            created_at: None,
        }
    }

    /// com.a has three snapshots (slot + two preserved), com.b only the
    /// live slot.
    fn subject_history() -> Vec<BackupEntry> {
        vec![
            package("com.a", OpType::Backup, 0, 0, Location::Local, 10, false),
            package("com.a", OpType::Restore, 0, 0, Location::Local, 10, false),
            package("com.a", OpType::Restore, 0, 1000, Location::Local, 11, false),
            package("com.a", OpType::Restore, 0, 2000, Location::Local, 12, false),
            package("com.b", OpType::Backup, 0, 0, Location::Local, 20, false),
            package("com.b", OpType::Restore, 0, 0, Location::Local, 20, false),
        ]
    }

    fn engine_with(entries: Vec<BackupEntry>) -> ListEngine {
        let mut engine = ListEngine::new(SubjectKind::Package);
        let user_ids = {
            let mut ids: Vec<u32> = entries.iter().filter_map(|e| e.user_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        engine.install_snapshot(entries, user_ids, None);
        engine
    }

    #[test]
    fn backup_mode_counts_exclude_the_current_slot_and_never_go_negative() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchBackup));

        let rows = &engine.view().rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subject_id, "com.a");
        assert_eq!(rows[0].backups_count, 2);
        assert_eq!(rows[1].subject_id, "com.b");
        assert_eq!(rows[1].backups_count, 0);
    }

    #[test]
    fn restore_mode_counts_every_snapshot() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchRestore));

        let rows = &engine.view().rows;
        assert_eq!(rows.len(), 4);
        let a_counts: Vec<u64> = rows
            .iter()
            .filter(|r| r.subject_id == "com.a")
            .map(|r| r.backups_count)
            .collect();
        assert_eq!(a_counts, vec![3, 3, 3]);
        let b_counts: Vec<u64> = rows
            .iter()
            .filter(|r| r.subject_id == "com.b")
            .map(|r| r.backups_count)
            .collect();
        assert_eq!(b_counts, vec![1]);
    }

    #[test]
    fn location_filter_resolves_registry_order() {
        let mut engine = engine_with(vec![
            package("com.a", OpType::Backup, 0, 0, Location::Local, 10, false),
            package(
                "com.b",
                OpType::Backup,
                0,
                0,
                Location::Remote("nas1".to_string()),
                10,
                false,
            ),
        ]);
        engine.set_accounts(vec!["nas1".to_string()]);

        assert_eq!(engine.view().locations, vec!["Local", "nas1"]);
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].subject_id, "com.a");

        engine.apply(Intent::FilterByLocation(1));
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].subject_id, "com.b");

        // Out of range: ignored, view unchanged.
        let applied = engine.apply(Intent::FilterByLocation(5));
        assert!(!applied.changed);
        assert_eq!(engine.view().location_index, 1);
    }

    #[test]
    fn account_removal_resets_an_out_of_range_location_to_local() {
        let mut engine = engine_with(vec![package(
            "com.a",
            OpType::Backup,
            0,
            0,
            Location::Local,
            10,
            false,
        )]);
        engine.set_accounts(vec!["nas1".to_string()]);
        engine.apply(Intent::FilterByLocation(1));

        engine.set_accounts(Vec::new());
        assert_eq!(engine.view().location_index, 0);
        assert_eq!(engine.view().rows.len(), 1);
    }

    #[test]
    fn key_filter_is_a_case_insensitive_substring_on_subject_id() {
        let mut engine = engine_with(vec![
            package("com.alpha", OpType::Backup, 0, 0, Location::Local, 1, false),
            package("com.beta", OpType::Backup, 0, 0, Location::Local, 1, false),
        ]);

        engine.apply(Intent::FilterByKey("ALPHA".to_string()));
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].subject_id, "com.alpha");

        engine.apply(Intent::FilterByKey(String::new()));
        assert_eq!(engine.view().rows.len(), 2);
    }

    #[test]
    fn flag_facet_splits_system_and_third_party_but_media_always_passes() {
        let mut engine = ListEngine::new(SubjectKind::Media);
        engine.install_snapshot(
            vec![media("camera", OpType::Backup, 0)],
            Vec::new(),
            None,
        );
        engine.apply(Intent::FilterByFlag(1));
        assert_eq!(engine.view().rows.len(), 1);

        let mut engine = engine_with(vec![
            package("com.sys", OpType::Backup, 0, 0, Location::Local, 1, true),
            package("com.user", OpType::Backup, 0, 0, Location::Local, 1, false),
        ]);
        engine.apply(Intent::FilterByFlag(1));
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].subject_id, "com.sys");

        engine.apply(Intent::FilterByFlag(2));
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].subject_id, "com.user");

        let applied = engine.apply(Intent::FilterByFlag(9));
        assert!(!applied.changed);
        assert_eq!(engine.view().flag_index, 2);
    }

    #[test]
    fn user_facet_selects_by_domain_index() {
        let mut engine = engine_with(vec![
            package("com.a", OpType::Backup, 0, 0, Location::Local, 1, false),
            package("com.b", OpType::Backup, 10, 0, Location::Local, 1, false),
        ]);
        assert_eq!(engine.view().user_id_domain, vec![0, 10]);

        engine.apply(Intent::SetUserIdIndexList(vec![1]));
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].user_id, Some(10));

        // Only out-of-range indices: ignored, selection stays.
        let applied = engine.apply(Intent::SetUserIdIndexList(vec![7]));
        assert!(!applied.changed);
        assert_eq!(engine.view().user_id_indices, vec![1]);
    }

    #[test]
    fn sort_honors_direction_and_breaks_ties_by_subject_ascending() {
        let mut engine = engine_with(vec![
            package("com.b", OpType::Backup, 0, 0, Location::Local, 5, false),
            package("com.a", OpType::Backup, 0, 0, Location::Local, 5, false),
            package("com.c", OpType::Backup, 0, 0, Location::Local, 9, false),
        ]);

        engine.apply(Intent::Sort {
            index: 1,
            order: SortOrder::Descending,
        });
        let subjects: Vec<&str> = engine
            .view()
            .rows
            .iter()
            .map(|r| r.subject_id.as_str())
            .collect();
        assert_eq!(subjects, vec!["com.c", "com.a", "com.b"]);

        engine.apply(Intent::Sort {
            index: 1,
            order: SortOrder::Ascending,
        });
        let subjects: Vec<&str> = engine
            .view()
            .rows
            .iter()
            .map(|r| r.subject_id.as_str())
            .collect();
        assert_eq!(subjects, vec!["com.a", "com.b", "com.c"]);

        let applied = engine.apply(Intent::Sort {
            index: 9,
            order: SortOrder::Descending,
        });
        assert!(!applied.changed);
    }

    #[test]
    fn repeated_intent_is_idempotent_on_the_view() {
        let mut engine = engine_with(subject_history());
        let first = engine.apply(Intent::FilterByKey("com.a".to_string()));
        assert!(first.changed);
        let view_after_first = engine.view().clone();

        let second = engine.apply(Intent::FilterByKey("com.a".to_string()));
        assert!(!second.changed);
        assert_eq!(engine.view(), &view_after_first);
    }

    #[test]
    fn selection_only_toggles_known_identities_outside_overview() {
        let mut engine = engine_with(subject_history());
        let identity = engine_identity(&engine, 0);

        // Overview: ignored.
        let applied = engine.apply(Intent::Select(identity.clone()));
        assert!(!applied.changed);
        assert_eq!(engine.view().activated_count, 0);

        engine.apply(Intent::SetMode(Mode::BatchBackup));
        engine.apply(Intent::Select(identity.clone()));
        assert_eq!(engine.view().activated_count, 1);
        assert!(engine.view().rows[0].selected);

        engine.apply(Intent::Select(identity.clone()));
        assert_eq!(engine.view().activated_count, 0);

        // Unknown identity: ignored.
        let mut ghost = identity.clone();
        ghost.preserve_id = 424242;
        let applied = engine.apply(Intent::Select(ghost));
        assert!(!applied.changed);
    }

    fn engine_identity(engine: &ListEngine, row: usize) -> EntryIdentity {
        engine.view().rows[row].identity.clone()
    }

    #[test]
    fn leaving_a_batch_mode_clears_the_selection() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchBackup));
        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 2);

        engine.apply(Intent::SetMode(Mode::Overview));
        assert_eq!(engine.view().activated_count, 0);

        // Crossing between batch modes abandons the old op's selection too.
        engine.apply(Intent::SetMode(Mode::BatchBackup));
        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 2);
        engine.apply(Intent::SetMode(Mode::BatchRestore));
        assert_eq!(engine.view().activated_count, 0);

        // Re-applying the current mode is not "leaving" it.
        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 4);
        engine.apply(Intent::SetMode(Mode::BatchRestore));
        assert_eq!(engine.view().activated_count, 4);
    }

    #[test]
    fn select_all_toggles_between_all_visible_and_none() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchRestore));

        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 4);
        assert!(engine.view().rows.iter().all(|r| r.selected));

        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 0);
    }

    #[test]
    fn select_all_respects_the_current_filter() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchRestore));
        engine.apply(Intent::FilterByKey("com.a".to_string()));

        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 3);

        engine.apply(Intent::FilterByKey(String::new()));
        let selected: Vec<&str> = engine
            .view()
            .rows
            .iter()
            .filter(|r| r.selected)
            .map(|r| r.subject_id.as_str())
            .collect();
        assert_eq!(selected, vec!["com.a", "com.a", "com.a"]);
    }

    #[test]
    fn snapshot_install_prunes_stale_selection() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchRestore));
        engine.apply(Intent::SelectAll);
        assert_eq!(engine.view().activated_count, 4);

        // Rescan finds only com.b's slot snapshot now.
        let remaining = vec![
            package("com.b", OpType::Backup, 0, 0, Location::Local, 20, false),
            package("com.b", OpType::Restore, 0, 0, Location::Local, 20, false),
        ];
        engine.install_snapshot(remaining, vec![0], None);

        assert_eq!(engine.view().activated_count, 1);
        assert!(engine.view().rows.iter().all(|r| r.selected));
    }

    #[test]
    fn delete_selected_requires_restore_mode_and_a_selection() {
        let mut engine = engine_with(subject_history());

        // Wrong mode.
        engine.apply(Intent::SetMode(Mode::BatchBackup));
        engine.apply(Intent::SelectAll);
        let applied = engine.apply(Intent::DeleteSelected);
        assert!(applied.commands.is_empty());

        // The mode switch dropped the backup-mode selection.
        engine.apply(Intent::SetMode(Mode::BatchRestore));
        let applied = engine.apply(Intent::DeleteSelected);
        assert!(applied.commands.is_empty());

        engine.apply(Intent::SelectAll);
        let applied = engine.apply(Intent::DeleteSelected);
        assert_eq!(applied.commands.len(), 1);
        let Command::DeleteThenRefresh(identities) = &applied.commands[0] else {
            panic!("expected a delete round");
        };
        assert_eq!(identities.len(), 4);
        assert_eq!(engine.view().activated_count, 0);
        assert!(engine.view().refreshing);
    }

    #[test]
    fn process_emits_the_selection_with_its_type_and_latches() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchBackup));
        engine.apply(Intent::SelectAll);

        let applied = engine.apply(Intent::Process(SelectionType::Both));
        assert_eq!(applied.commands.len(), 1);
        let Command::Process {
            selection,
            identities,
        } = &applied.commands[0] else {
            panic!("expected a process round");
        };
        assert_eq!(*selection, SelectionType::Both);
        assert_eq!(identities.len(), 2);
        assert!(engine.view().processing);

        // Latched: a second process is ignored until completion.
        let applied = engine.apply(Intent::Process(SelectionType::Apk));
        assert!(applied.commands.is_empty());

        engine.batch_done(None);
        assert!(!engine.view().processing);
    }

    #[test]
    fn refresh_requests_coalesce_while_one_is_in_flight() {
        let mut engine = engine_with(subject_history());

        let first = engine.apply(Intent::OnRefresh);
        assert_eq!(first.commands, vec![Command::Refresh]);
        assert!(engine.view().refreshing);

        let second = engine.apply(Intent::OnRefresh);
        assert!(second.commands.is_empty());
        assert!(!second.changed);

        engine.install_snapshot(subject_history(), vec![0], None);
        assert!(!engine.view().refreshing);

        let third = engine.apply(Intent::OnRefresh);
        assert_eq!(third.commands, vec![Command::Refresh]);
    }

    #[test]
    fn destructive_intents_are_ignored_while_busy() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::SetMode(Mode::BatchRestore));
        engine.apply(Intent::SelectAll);
        engine.apply(Intent::OnRefresh);

        assert!(engine.apply(Intent::DeleteSelected).commands.is_empty());
        assert!(engine
            .apply(Intent::Process(SelectionType::Default))
            .commands
            .is_empty());

        let identity = engine_identity(&engine, 0);
        let before = engine.view().activated_count;
        engine.apply(Intent::Select(identity));
        assert_eq!(engine.view().activated_count, before);
    }

    #[test]
    fn filter_intents_stay_live_during_a_refresh() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::OnRefresh);

        let applied = engine.apply(Intent::FilterByKey("com.b".to_string()));
        assert!(applied.changed);
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].subject_id, "com.b");
    }

    #[test]
    fn refresh_failure_surfaces_as_a_notice_and_unlatches() {
        let mut engine = engine_with(subject_history());
        engine.apply(Intent::OnRefresh);

        engine.refresh_failed("scan failed: disk gone".to_string());
        assert!(!engine.view().refreshing);
        assert_eq!(
            engine.view().notice.as_deref(),
            Some("scan failed: disk gone")
        );
    }

    #[test]
    fn media_rows_ignore_the_user_facet() {
        let mut engine = ListEngine::new(SubjectKind::Media);
        engine.install_snapshot(
            vec![
                media("camera", OpType::Backup, 0),
                media("camera", OpType::Restore, 0),
                media("camera", OpType::Restore, 3000),
            ],
            Vec::new(),
            None,
        );

        engine.apply(Intent::SetMode(Mode::BatchBackup));
        assert_eq!(engine.view().rows.len(), 1);
        assert_eq!(engine.view().rows[0].backups_count, 1);

        engine.apply(Intent::SetMode(Mode::BatchRestore));
        assert_eq!(engine.view().rows.len(), 2);
        assert!(engine.view().rows.iter().all(|r| r.backups_count == 2));
    }
}

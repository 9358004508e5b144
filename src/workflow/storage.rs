/// SQLite persistence layer for workflows and their audit trail
///
/// Handles workflows, revisions, comments and next-step records. Every state
/// transition goes through [`WorkflowStore::update`], which only applies when
/// the approval timestamps still match what the caller read.

use crate::workflow::types::{
    now, Action, Comment, Creator, NewNextStep, NewWorkflow, NextStepRecord, Revision, Team,
    Workflow, WorkflowType,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite,
};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// A conditioned update lost a race with another writer
    #[error("workflow {0} was changed by another request")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Change to a nullable column
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Unchanged,
    Set(T),
    Clear,
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unchanged
    }
}

impl<T> Patch<T> {
    /// `Set` for `Some`, `Clear` for `None`
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Patch::Set(value),
            None => Patch::Clear,
        }
    }
}

/// Field changes applied by a transition
#[derive(Debug, Clone, Default)]
pub struct WorkflowChanges {
    pub submitted_at: Patch<DateTime<Utc>>,
    pub submitted_by: Patch<String>,
    pub manager_approved_at: Patch<DateTime<Utc>>,
    pub manager_approved_by: Patch<String>,
    pub needs_panel_approval: Option<bool>,
    pub panel_approved_at: Patch<DateTime<Utc>>,
    pub panel_approved_by: Patch<String>,
    pub discarded_at: Patch<DateTime<Utc>>,
    pub discarded_by: Patch<String>,
    pub held_at: Patch<DateTime<Utc>>,
    pub assigned_to: Patch<String>,
    pub team_assigned_to: Patch<Team>,
}

/// Value bound into a SET clause
enum Column {
    Text(Option<String>),
    Flag(bool),
}

impl WorkflowChanges {
    fn assignments(&self) -> Vec<(&'static str, Column)> {
        fn timestamp(patch: &Patch<DateTime<Utc>>) -> Option<Column> {
            match patch {
                Patch::Unchanged => None,
                Patch::Set(ts) => Some(Column::Text(Some(encode_ts(ts)))),
                Patch::Clear => Some(Column::Text(None)),
            }
        }
        fn text(patch: &Patch<String>) -> Option<Column> {
            match patch {
                Patch::Unchanged => None,
                Patch::Set(value) => Some(Column::Text(Some(value.clone()))),
                Patch::Clear => Some(Column::Text(None)),
            }
        }

        let team = match &self.team_assigned_to {
            Patch::Unchanged => None,
            Patch::Set(team) => Some(Column::Text(Some(team.as_str().to_string()))),
            Patch::Clear => Some(Column::Text(None)),
        };

        [
            ("submitted_at", timestamp(&self.submitted_at)),
            ("submitted_by", text(&self.submitted_by)),
            ("manager_approved_at", timestamp(&self.manager_approved_at)),
            ("manager_approved_by", text(&self.manager_approved_by)),
            ("needs_panel_approval", self.needs_panel_approval.map(Column::Flag)),
            ("panel_approved_at", timestamp(&self.panel_approved_at)),
            ("panel_approved_by", text(&self.panel_approved_by)),
            ("discarded_at", timestamp(&self.discarded_at)),
            ("discarded_by", text(&self.discarded_by)),
            ("held_at", timestamp(&self.held_at)),
            ("assigned_to", text(&self.assigned_to)),
            ("team_assigned_to", team),
        ]
        .into_iter()
        .filter_map(|(column, value)| value.map(|value| (column, value)))
        .collect()
    }
}

/// Expected lifecycle timestamps for a conditioned update
///
/// The update only applies if every one of these still matches the row.
#[derive(Debug, Clone, PartialEq)]
pub struct StateGuard {
    pub submitted_at: Option<DateTime<Utc>>,
    pub manager_approved_at: Option<DateTime<Utc>>,
    pub panel_approved_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub held_at: Option<DateTime<Utc>>,
}

impl StateGuard {
    /// Guard on the timestamps of a freshly read workflow
    pub fn of(workflow: &Workflow) -> Self {
        Self {
            submitted_at: workflow.submitted_at,
            manager_approved_at: workflow.manager_approved_at,
            panel_approved_at: workflow.panel_approved_at,
            discarded_at: workflow.discarded_at,
            held_at: workflow.held_at,
        }
    }

    fn conditions(&self) -> [(&'static str, Option<String>); 5] {
        [
            ("submitted_at", self.submitted_at.as_ref().map(encode_ts)),
            ("manager_approved_at", self.manager_approved_at.as_ref().map(encode_ts)),
            ("panel_approved_at", self.panel_approved_at.as_ref().map(encode_ts)),
            ("discarded_at", self.discarded_at.as_ref().map(encode_ts)),
            ("held_at", self.held_at.as_ref().map(encode_ts)),
        ]
    }
}

/// Revision to append with an update
#[derive(Debug, Clone)]
pub struct NewRevision {
    pub action: Action,
    pub created_by: String,
    pub answers: Value,
}

/// Comment to append with an update
#[derive(Debug, Clone)]
pub struct NewComment {
    pub action: Action,
    pub created_by: String,
    pub text: String,
}

/// Audit entries written in the same transaction as an update
#[derive(Debug, Clone, Default)]
pub struct Audit {
    pub revision: Option<NewRevision>,
    pub comment: Option<NewComment>,
}

/// Persistence boundary for workflows
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Load a workflow with all of its next steps
    async fn get(&self, id: &str) -> StoreResult<Workflow>;

    async fn create(&self, new: NewWorkflow, creator: &Creator) -> StoreResult<Workflow>;

    /// Apply `changes` and `audit` atomically if `guard` still holds
    ///
    /// Returns [`StoreError::Conflict`] when another writer got there first.
    async fn update(
        &self,
        id: &str,
        guard: &StateGuard,
        changes: WorkflowChanges,
        audit: Audit,
    ) -> StoreResult<Workflow>;

    /// Start a follow-on workflow owned by `parent_creator`
    async fn create_child(
        &self,
        parent_creator: &Creator,
        form_id: &str,
        subject_id: &str,
    ) -> StoreResult<Workflow>;

    async fn add_next_step(&self, workflow_id: &str, step: NewNextStep) -> StoreResult<NextStepRecord>;

    /// Retire a next step. Returns false if it had already been triggered.
    async fn mark_next_step_triggered(&self, record_id: &str) -> StoreResult<bool>;

    async fn revisions(&self, workflow_id: &str) -> StoreResult<Vec<Revision>>;

    async fn comments(&self, workflow_id: &str) -> StoreResult<Vec<Comment>>;
}

/// SQLite-backed workflow store
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url` and ensure the schema
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, kept on a single connection
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) async fn count_workflows_with_form(&self, form_id: &str) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM workflows WHERE form_id = ?")
            .bind(form_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                form_id TEXT NOT NULL,
                social_care_id TEXT NOT NULL,
                answers JSON NOT NULL DEFAULT '{}',
                review_of TEXT,
                created_by TEXT NOT NULL,
                creator_team TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                submitted_at TEXT,
                submitted_by TEXT,
                manager_approved_at TEXT,
                manager_approved_by TEXT,
                needs_panel_approval INTEGER NOT NULL DEFAULT 0,
                panel_approved_at TEXT,
                panel_approved_by TEXT,
                discarded_at TEXT,
                discarded_by TEXT,
                held_at TEXT,
                assigned_to TEXT,
                team_assigned_to TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS revisions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                action TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                answers JSON NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comments (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                text TEXT NOT NULL,
                action TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS next_steps (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                next_step_option_id TEXT NOT NULL,
                triggered_at TEXT,
                alt_social_care_id TEXT,
                note TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_revisions_workflow ON revisions(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_comments_workflow ON comments(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_next_steps_workflow ON next_steps(workflow_id)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn insert_workflow(
        &self,
        form_id: &str,
        social_care_id: &str,
        workflow_type: WorkflowType,
        review_of: Option<&str>,
        answers: &Value,
        creator: &Creator,
    ) -> StoreResult<Workflow> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = encode_ts(&now());
        let team = creator.team.map(|team| team.as_str());

        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, type, form_id, social_care_id, answers, review_of,
                created_by, creator_team, created_at, updated_at,
                assigned_to, team_assigned_to
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(workflow_type.as_str())
        .bind(form_id)
        .bind(social_care_id)
        .bind(serde_json::to_string(answers)?)
        .bind(review_of)
        .bind(&creator.email)
        .bind(team)
        .bind(&created_at)
        .bind(&created_at)
        .bind(&creator.email)
        .bind(team)
        .execute(&self.pool)
        .await?;

        self.get(&id).await
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn get(&self, id: &str) -> StoreResult<Workflow> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut workflow = workflow_from_row(&row)?;

        let steps = sqlx::query("SELECT * FROM next_steps WHERE workflow_id = ? ORDER BY seq")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        workflow.next_steps = steps
            .iter()
            .map(next_step_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(workflow)
    }

    async fn create(&self, new: NewWorkflow, creator: &Creator) -> StoreResult<Workflow> {
        let answers = new.answers.unwrap_or_else(|| Value::Object(Default::default()));
        self.insert_workflow(
            &new.form_id,
            &new.social_care_id,
            new.workflow_type,
            new.review_of.as_deref(),
            &answers,
            creator,
        )
        .await
    }

    async fn update(
        &self,
        id: &str,
        guard: &StateGuard,
        changes: WorkflowChanges,
        audit: Audit,
    ) -> StoreResult<Workflow> {
        let updated_at = now();
        let mut tx = self.pool.begin().await?;

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE workflows SET updated_at = ");
        query.push_bind(encode_ts(&updated_at));
        for (column, value) in changes.assignments() {
            query.push(", ").push(column).push(" = ");
            match value {
                Column::Text(text) => query.push_bind(text),
                Column::Flag(flag) => query.push_bind(flag),
            };
        }
        query.push(" WHERE id = ").push_bind(id.to_string());
        // IS compares NULL as equal to NULL
        for (column, expected) in guard.conditions() {
            query.push(" AND ").push(column).push(" IS ").push_bind(expected);
        }

        let result = query.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return Err(if exists {
                StoreError::Conflict(id.to_string())
            } else {
                StoreError::NotFound(id.to_string())
            });
        }

        if let Some(revision) = audit.revision {
            sqlx::query(
                "INSERT INTO revisions (id, workflow_id, action, created_by, created_at, answers) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(id)
            .bind(revision.action.as_str())
            .bind(&revision.created_by)
            .bind(encode_ts(&updated_at))
            .bind(serde_json::to_string(&revision.answers)?)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(comment) = audit.comment {
            sqlx::query(
                "INSERT INTO comments (id, workflow_id, text, action, created_by, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(id)
            .bind(&comment.text)
            .bind(comment.action.as_str())
            .bind(&comment.created_by)
            .bind(encode_ts(&updated_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get(id).await
    }

    async fn create_child(
        &self,
        parent_creator: &Creator,
        form_id: &str,
        subject_id: &str,
    ) -> StoreResult<Workflow> {
        let answers = Value::Object(Default::default());
        self.insert_workflow(
            form_id,
            subject_id,
            WorkflowType::Assessment,
            None,
            &answers,
            parent_creator,
        )
        .await
    }

    async fn add_next_step(&self, workflow_id: &str, step: NewNextStep) -> StoreResult<NextStepRecord> {
        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound(workflow_id.to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now();

        sqlx::query(
            r#"
            INSERT INTO next_steps (id, workflow_id, next_step_option_id, alt_social_care_id, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(workflow_id)
        .bind(&step.next_step_option_id)
        .bind(&step.alt_social_care_id)
        .bind(&step.note)
        .bind(encode_ts(&created_at))
        .execute(&self.pool)
        .await?;

        Ok(NextStepRecord {
            id,
            workflow_id: workflow_id.to_string(),
            next_step_option_id: step.next_step_option_id,
            triggered_at: None,
            alt_social_care_id: step.alt_social_care_id,
            note: step.note,
            created_at,
        })
    }

    async fn mark_next_step_triggered(&self, record_id: &str) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE next_steps SET triggered_at = ? WHERE id = ? AND triggered_at IS NULL")
                .bind(encode_ts(&now()))
                .bind(record_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revisions(&self, workflow_id: &str) -> StoreResult<Vec<Revision>> {
        let rows = sqlx::query("SELECT * FROM revisions WHERE workflow_id = ? ORDER BY seq")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;

        let mut revisions = Vec::with_capacity(rows.len());
        for row in rows {
            let answers: String = row.try_get("answers")?;
            revisions.push(Revision {
                id: row.try_get("id")?,
                workflow_id: row.try_get("workflow_id")?,
                action: parse_column(&row, "action")?,
                created_by: row.try_get("created_by")?,
                created_at: required_ts(&row, "created_at")?,
                answers: serde_json::from_str(&answers)?,
            });
        }

        Ok(revisions)
    }

    async fn comments(&self, workflow_id: &str) -> StoreResult<Vec<Comment>> {
        let rows = sqlx::query("SELECT * FROM comments WHERE workflow_id = ? ORDER BY seq")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;

        let mut comments = Vec::with_capacity(rows.len());
        for row in rows {
            comments.push(Comment {
                id: row.try_get("id")?,
                workflow_id: row.try_get("workflow_id")?,
                text: row.try_get("text")?,
                action: parse_column(&row, "action")?,
                created_by: row.try_get("created_by")?,
                created_at: required_ts(&row, "created_at")?,
            });
        }

        Ok(comments)
    }
}

/// Encode a timestamp the way every column stores it
fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(column: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", column, e)))
}

fn optional_ts(row: &SqliteRow, column: &str) -> StoreResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| decode_ts(column, &raw)).transpose()
}

fn required_ts(row: &SqliteRow, column: &str) -> StoreResult<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    decode_ts(column, &raw)
}

fn parse_column<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> StoreResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(StoreError::Corrupt)
}

fn optional_team(row: &SqliteRow, column: &str) -> StoreResult<Option<Team>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| raw.parse().map_err(StoreError::Corrupt)).transpose()
}

fn workflow_from_row(row: &SqliteRow) -> StoreResult<Workflow> {
    let answers: String = row.try_get("answers")?;

    Ok(Workflow {
        id: row.try_get("id")?,
        workflow_type: parse_column(row, "type")?,
        form_id: row.try_get("form_id")?,
        social_care_id: row.try_get("social_care_id")?,
        answers: serde_json::from_str(&answers)?,
        review_of: row.try_get("review_of")?,
        creator: Creator {
            email: row.try_get("created_by")?,
            team: optional_team(row, "creator_team")?,
        },
        created_at: required_ts(row, "created_at")?,
        updated_at: required_ts(row, "updated_at")?,
        submitted_at: optional_ts(row, "submitted_at")?,
        submitted_by: row.try_get("submitted_by")?,
        manager_approved_at: optional_ts(row, "manager_approved_at")?,
        manager_approved_by: row.try_get("manager_approved_by")?,
        needs_panel_approval: row.try_get("needs_panel_approval")?,
        panel_approved_at: optional_ts(row, "panel_approved_at")?,
        panel_approved_by: row.try_get("panel_approved_by")?,
        discarded_at: optional_ts(row, "discarded_at")?,
        discarded_by: row.try_get("discarded_by")?,
        held_at: optional_ts(row, "held_at")?,
        assigned_to: row.try_get("assigned_to")?,
        team_assigned_to: optional_team(row, "team_assigned_to")?,
        next_steps: Vec::new(),
    })
}

fn next_step_from_row(row: &SqliteRow) -> StoreResult<NextStepRecord> {
    Ok(NextStepRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        next_step_option_id: row.try_get("next_step_option_id")?,
        triggered_at: optional_ts(row, "triggered_at")?,
        alt_social_care_id: row.try_get("alt_social_care_id")?,
        note: row.try_get("note")?,
        created_at: required_ts(row, "created_at")?,
    })
}

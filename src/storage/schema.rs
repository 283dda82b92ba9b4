//! Database schema constants.
//!
//! SQL definitions for the PostgreSQL ledger and rule stores.

/// Pipeline runs, one row per triggered run.
pub const CREATE_PIPELINE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id UUID PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    owner VARCHAR(255),
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb
)
"#;

/// Steps of a run. `position` keeps declared order.
pub const CREATE_PIPELINE_STEPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_steps (
    id UUID PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    step_type VARCHAR(50) NOT NULL,
    position SMALLINT NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    error TEXT,
    UNIQUE(run_id, step_type)
)
"#;

/// Persisted business rules.
pub const CREATE_BUSINESS_RULES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS business_rules (
    id UUID PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    name VARCHAR(255) NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    condition TEXT NOT NULL,
    severity VARCHAR(10) NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    source VARCHAR(30) NOT NULL,
    model_generated BOOLEAN NOT NULL DEFAULT FALSE,
    confidence DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Index statements, one per entry.
pub const CREATE_INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_dataset ON pipeline_runs(dataset_id)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_started ON pipeline_runs(started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_steps_run ON pipeline_steps(run_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_steps_status ON pipeline_steps(status)",
    "CREATE INDEX IF NOT EXISTS idx_business_rules_dataset ON business_rules(dataset_id, active)",
];

/// Returns all schema statements in order of execution.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_PIPELINE_RUNS_TABLE,
        CREATE_PIPELINE_STEPS_TABLE,
        CREATE_BUSINESS_RULES_TABLE,
    ];
    statements.extend(CREATE_INDEXES);
    statements
}

/// Tables in reverse dependency order, for resets.
pub const TABLES_REVERSE_ORDER: [&str; 4] = ["business_rules", "pipeline_steps", "pipeline_runs", "_migrations"];

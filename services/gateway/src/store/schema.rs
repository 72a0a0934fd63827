pub const TENANTS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    theme_id TEXT NOT NULL,
    maintenance_mode INTEGER NOT NULL DEFAULT 0,
    read_only_mode INTEGER NOT NULL DEFAULT 0,
    feature_flags TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub const TENANT_RULES_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_rules (
    domain_pattern TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_tenant_rules_tenant ON tenant_rules(tenant_id);
"#;

pub const ROUTE_RULES_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS route_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    url_pattern TEXT NOT NULL,
    route_type TEXT NOT NULL,
    visible INTEGER NOT NULL DEFAULT 1,
    accessible INTEGER NOT NULL DEFAULT 1,
    read_roles TEXT NOT NULL,
    write_roles TEXT NOT NULL,
    parent_id INTEGER,
    display_order INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_route_rules_tenant ON route_rules(tenant_id);
"#;

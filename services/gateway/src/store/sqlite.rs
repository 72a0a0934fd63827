use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::schema::{ROUTE_RULES_TABLE_SCHEMA, TENANTS_TABLE_SCHEMA, TENANT_RULES_TABLE_SCHEMA};
use super::{RouteAdminStore, RouteStore, StoreError, TenantAdminStore, TenantStore};
use super::GATEWAY_DB_FILENAME;
use crate::context::spawn_blocking_with_context;
use crate::route::types::{roles_from_csv, roles_to_csv};
use crate::route::{NewRouteRule, RouteRule, RouteType};
use crate::tenant::{TenantMetadata, TenantRule};

const ROUTE_COLUMNS: &str = "id, tenant_id, name, url_pattern, route_type, visible, accessible, \
                             read_roles, write_roles, parent_id, display_order";

/// SQLite-backed tenant and route store. Queries run on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join(GATEWAY_DB_FILENAME))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(TENANTS_TABLE_SCHEMA)?;
        conn.execute_batch(TENANT_RULES_TABLE_SCHEMA)?;
        conn.execute_batch(ROUTE_RULES_TABLE_SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection off the async workers. The caller's
    /// request context and span stay bound inside `f`.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking_with_context(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Unavailable(format!("store task failed: {err}")))?
    }
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<(TenantMetadata, String)> {
    Ok((
        TenantMetadata {
            tenant_id: row.get(0)?,
            display_name: row.get(1)?,
            theme_id: row.get(2)?,
            maintenance_mode: row.get(3)?,
            read_only_mode: row.get(4)?,
            feature_flags: BTreeMap::new(),
        },
        row.get(5)?,
    ))
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<RouteRule> {
    let route_type: String = row.get(4)?;
    let read_roles: String = row.get(7)?;
    let write_roles: String = row.get(8)?;
    let id: i64 = row.get(0)?;
    let parent_id: Option<i64> = row.get(9)?;

    Ok(RouteRule {
        id: id as u64,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        url_pattern: row.get(3)?,
        route_type: route_type.parse().map_err(|err: String| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                err.into(),
            )
        })?,
        visible: row.get(5)?,
        accessible: row.get(6)?,
        read_roles: roles_from_csv(&read_roles),
        write_roles: roles_from_csv(&write_roles),
        parent_id: parent_id.map(|id| id as u64),
        display_order: row.get(10)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conflict_or(err: rusqlite::Error, what: String) -> StoreError {
    if is_constraint_violation(&err) {
        StoreError::Conflict(what)
    } else {
        err.into()
    }
}

fn owner_of(tx: &Transaction<'_>, domain_pattern: &str) -> Result<String, StoreError> {
    tx.query_row(
        "SELECT tenant_id FROM tenant_rules WHERE domain_pattern = ?1",
        params![domain_pattern],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("domain pattern {domain_pattern}")))
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn list_all_rules(&self) -> Result<Vec<TenantRule>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT domain_pattern, tenant_id
                FROM tenant_rules
                ORDER BY domain_pattern
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(TenantRule {
                    domain_pattern: row.get(0)?,
                    tenant_id: row.get(1)?,
                })
            })?;

            let mut rules = Vec::new();
            for rule in rows {
                rules.push(rule?);
            }
            Ok(rules)
        })
        .await
    }

    async fn get_metadata(&self, tenant_id: &str) -> Result<Option<TenantMetadata>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT tenant_id, display_name, theme_id, maintenance_mode, read_only_mode, feature_flags
                    FROM tenants
                    WHERE tenant_id = ?1
                    "#,
                    params![tenant_id],
                    metadata_from_row,
                )
                .optional()?;

            match row {
                Some((mut metadata, flags)) => {
                    metadata.feature_flags = serde_json::from_str(&flags)?;
                    Ok(Some(metadata))
                }
                None => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
impl TenantAdminStore for SqliteStore {
    async fn insert_tenant(
        &self,
        metadata: &TenantMetadata,
        rules: &[TenantRule],
    ) -> Result<(), StoreError> {
        let flags = serde_json::to_string(&metadata.feature_flags)?;
        let metadata = metadata.clone();
        let rules = rules.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO tenants (tenant_id, display_name, theme_id, maintenance_mode, read_only_mode, feature_flags, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    metadata.tenant_id,
                    metadata.display_name,
                    metadata.theme_id,
                    metadata.maintenance_mode,
                    metadata.read_only_mode,
                    flags,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|err| conflict_or(err, format!("tenant {}", metadata.tenant_id)))?;

            for rule in &rules {
                tx.execute(
                    "INSERT INTO tenant_rules (domain_pattern, tenant_id) VALUES (?1, ?2)",
                    params![rule.domain_pattern, rule.tenant_id],
                )
                .map_err(|err| conflict_or(err, format!("domain pattern {}", rule.domain_pattern)))?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_metadata(&self, metadata: &TenantMetadata) -> Result<(), StoreError> {
        let flags = serde_json::to_string(&metadata.feature_flags)?;
        let metadata = metadata.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE tenants
                SET display_name = ?2,
                    theme_id = ?3,
                    maintenance_mode = ?4,
                    read_only_mode = ?5,
                    feature_flags = ?6,
                    updated_at = ?7
                WHERE tenant_id = ?1
                "#,
                params![
                    metadata.tenant_id,
                    metadata.display_name,
                    metadata.theme_id,
                    metadata.maintenance_mode,
                    metadata.read_only_mode,
                    flags,
                    Utc::now().to_rfc3339()
                ],
            )?;

            if updated == 0 {
                return Err(StoreError::NotFound(format!("tenant {}", metadata.tenant_id)));
            }
            Ok(())
        })
        .await
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let deleted =
                tx.execute("DELETE FROM tenants WHERE tenant_id = ?1", params![tenant_id])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
            }
            // tenant_rules goes through its foreign key; routes carry no key.
            tx.execute(
                "DELETE FROM route_rules WHERE tenant_id = ?1",
                params![tenant_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_domain_rule(&self, rule: &TenantRule) -> Result<(), StoreError> {
        let rule = rule.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tenant_rules (domain_pattern, tenant_id) VALUES (?1, ?2)",
                params![rule.domain_pattern, rule.tenant_id],
            )
            .map_err(|err| conflict_or(err, format!("domain pattern {}", rule.domain_pattern)))?;
            Ok(())
        })
        .await
    }

    async fn delete_domain_rule(&self, domain_pattern: &str) -> Result<TenantRule, StoreError> {
        let domain_pattern = domain_pattern.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let tenant_id = owner_of(&tx, &domain_pattern)?;
            tx.execute(
                "DELETE FROM tenant_rules WHERE domain_pattern = ?1",
                params![domain_pattern],
            )?;
            tx.commit()?;
            Ok(TenantRule {
                domain_pattern,
                tenant_id,
            })
        })
        .await
    }

    async fn replace_domain_rule(
        &self,
        current: &str,
        replacement: &str,
    ) -> Result<TenantRule, StoreError> {
        let current = current.to_string();
        let replacement = replacement.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let tenant_id = owner_of(&tx, &current)?;
            tx.execute(
                "UPDATE tenant_rules SET domain_pattern = ?2 WHERE domain_pattern = ?1",
                params![current, replacement],
            )
            .map_err(|err| conflict_or(err, format!("domain pattern {replacement}")))?;
            tx.commit()?;
            Ok(TenantRule {
                domain_pattern: replacement,
                tenant_id,
            })
        })
        .await
    }
}

#[async_trait]
impl RouteStore for SqliteStore {
    async fn list_rules(&self, tenant_id: &str) -> Result<Vec<RouteRule>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROUTE_COLUMNS} FROM route_rules WHERE tenant_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![tenant_id], route_from_row)?;

            let mut rules = Vec::new();
            for rule in rows {
                rules.push(rule?);
            }
            Ok(rules)
        })
        .await
    }
}

#[async_trait]
impl RouteAdminStore for SqliteStore {
    async fn get_rule(&self, id: u64) -> Result<Option<RouteRule>, StoreError> {
        self.run(move |conn| {
            let rule = conn
                .query_row(
                    &format!("SELECT {ROUTE_COLUMNS} FROM route_rules WHERE id = ?1"),
                    params![id as i64],
                    route_from_row,
                )
                .optional()?;
            Ok(rule)
        })
        .await
    }

    async fn insert_rule(
        &self,
        tenant_id: &str,
        rule: NewRouteRule,
    ) -> Result<RouteRule, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO route_rules (tenant_id, name, url_pattern, route_type, visible, accessible,
                                         read_roles, write_roles, parent_id, display_order, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    tenant_id,
                    rule.name,
                    rule.url_pattern,
                    rule.route_type.as_str(),
                    rule.visible,
                    rule.accessible,
                    roles_to_csv(&rule.read_roles),
                    roles_to_csv(&rule.write_roles),
                    rule.parent_id.map(|id| id as i64),
                    rule.display_order,
                    Utc::now().to_rfc3339()
                ],
            )?;
            let id = conn.last_insert_rowid() as u64;
            Ok(rule.into_rule(id, tenant_id))
        })
        .await
    }

    async fn update_rule(&self, rule: &RouteRule) -> Result<(), StoreError> {
        let rule = rule.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE route_rules
                SET name = ?2,
                    url_pattern = ?3,
                    route_type = ?4,
                    visible = ?5,
                    accessible = ?6,
                    read_roles = ?7,
                    write_roles = ?8,
                    parent_id = ?9,
                    display_order = ?10,
                    updated_at = ?11
                WHERE id = ?1 AND tenant_id = ?12
                "#,
                params![
                    rule.id as i64,
                    rule.name,
                    rule.url_pattern,
                    rule.route_type.as_str(),
                    rule.visible,
                    rule.accessible,
                    roles_to_csv(&rule.read_roles),
                    roles_to_csv(&rule.write_roles),
                    rule.parent_id.map(|id| id as i64),
                    rule.display_order,
                    Utc::now().to_rfc3339(),
                    rule.tenant_id
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("route {}", rule.id)));
            }
            Ok(())
        })
        .await
    }

    async fn delete_rule(&self, id: u64) -> Result<(), StoreError> {
        self.run(move |conn| {
            let deleted =
                conn.execute("DELETE FROM route_rules WHERE id = ?1", params![id as i64])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("route {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn delete_rules_for_tenant(&self, tenant_id: &str) -> Result<u64, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM route_rules WHERE tenant_id = ?1",
                params![tenant_id],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn set_display_orders(
        &self,
        tenant_id: &str,
        orders: &[(u64, i32)],
    ) -> Result<(), StoreError> {
        let tenant_id = tenant_id.to_string();
        let orders = orders.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for (id, order) in &orders {
                let updated = tx.execute(
                    "UPDATE route_rules SET display_order = ?1 WHERE id = ?2 AND tenant_id = ?3",
                    params![order, *id as i64, tenant_id],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("route {id}")));
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, Channel, RequestContext};
    use crate::tenant::DEFAULT_TENANT_ID;
    use tempfile::TempDir;

    fn rule(pattern: &str, tenant: &str) -> TenantRule {
        TenantRule {
            domain_pattern: pattern.into(),
            tenant_id: tenant.into(),
        }
    }

    #[tokio::test]
    async fn tenant_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            let mut meta = TenantMetadata::new("shop", "Shop");
            meta.theme_id = "dark".into();
            store
                .insert_tenant(&meta, &[rule("*.shop.com", "shop")])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(dir.path()).unwrap();
        let meta = store.get_metadata("shop").await.unwrap().unwrap();
        assert_eq!(meta.theme_id, "dark");
        assert!(meta.feature_enabled("board_module"));
        assert_eq!(store.list_all_rules().await.unwrap(), vec![rule("*.shop.com", "shop")]);
    }

    #[tokio::test]
    async fn queries_see_the_callers_request_context() {
        let store = SqliteStore::in_memory().unwrap();
        let context = RequestContext::new("trace-7", "en", Channel::Web)
            .with_tenant(Arc::new(TenantMetadata::new("shop", "Shop")));

        let bound = context::scope(context, store.run(|_| Ok(context::current_tenant_id())))
            .await
            .unwrap();
        assert_eq!(bound, "shop");

        let unbound = store.run(|_| Ok(context::current_tenant_id())).await.unwrap();
        assert_eq!(unbound, DEFAULT_TENANT_ID);
    }

    #[test]
    fn data_dir_that_is_a_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(SqliteStore::open(&file), Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn duplicate_domain_rolls_back_tenant() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a.com", "a")])
            .await
            .unwrap();
        let err = store
            .insert_tenant(&TenantMetadata::new("b", "B"), &[rule("a.com", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get_metadata("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_tenant_cascades_rules() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a.com", "a")])
            .await
            .unwrap();
        store.delete_tenant("a").await.unwrap();
        assert!(store.list_all_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_tenant_drops_its_routes() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a.com", "a")])
            .await
            .unwrap();
        store.insert_rule("a", NewRouteRule::new("Home", "/")).await.unwrap();
        store.insert_rule("b", NewRouteRule::new("Home", "/")).await.unwrap();

        store.delete_tenant("a").await.unwrap();
        assert!(store.list_rules("a").await.unwrap().is_empty());
        assert_eq!(store.list_rules("b").await.unwrap().len(), 1);

        // A tenant re-created under the same id starts without routes.
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a.com", "a")])
            .await
            .unwrap();
        assert!(store.list_rules("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_domain_is_all_or_nothing() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a.com", "a")])
            .await
            .unwrap();
        store
            .insert_tenant(&TenantMetadata::new("b", "B"), &[rule("b.com", "b")])
            .await
            .unwrap();

        let err = store.replace_domain_rule("a.com", "b.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(
            store.list_all_rules().await.unwrap(),
            vec![rule("a.com", "a"), rule("b.com", "b")]
        );

        let moved = store.replace_domain_rule("a.com", "*.a.com").await.unwrap();
        assert_eq!(moved, rule("*.a.com", "a"));
        assert!(matches!(
            store.replace_domain_rule("gone.com", "x.com").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn route_rules_persist_roles_and_order() {
        let store = SqliteStore::in_memory().unwrap();
        let mut new_rule = NewRouteRule::new("Notice", "/board/notice/**");
        new_rule.route_type = RouteType::Board;
        new_rule.read_roles = roles_from_csv("ROLE_USER,ROLE_ADMIN");
        let created = store.insert_rule("shop", new_rule).await.unwrap();

        store
            .set_display_orders("shop", &[(created.id, 3)])
            .await
            .unwrap();
        let loaded = store.list_rules("shop").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].route_type, RouteType::Board);
        assert_eq!(loaded[0].display_order, 3);
        assert!(loaded[0].read_roles.contains("ROLE_USER"));
        assert!(store.list_rules("other").await.unwrap().is_empty());
    }
}

//! SQL-backed catalog and log store.
//!
//! Entities are stored as a JSON document plus the key columns the
//! queries filter and page on. The concrete driver is sqlite; other SQL
//! backends plug in behind the [`Datastore`] trait.

use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::{Error, Result};

use crate::{CallFilter, Datastore, LogStore, Page};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        doc TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS routes (
        app_name TEXT NOT NULL,
        path TEXT NOT NULL,
        doc TEXT NOT NULL,
        PRIMARY KEY (app_name, path)
    )",
    "CREATE TABLE IF NOT EXISTS fns (
        id TEXT PRIMARY KEY,
        app_id TEXT NOT NULL,
        name TEXT NOT NULL,
        doc TEXT NOT NULL,
        UNIQUE (app_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS triggers (
        id TEXT PRIMARY KEY,
        app_id TEXT NOT NULL,
        fn_id TEXT NOT NULL,
        name TEXT NOT NULL,
        ttype TEXT NOT NULL,
        source TEXT NOT NULL,
        doc TEXT NOT NULL,
        UNIQUE (app_id, name),
        UNIQUE (app_id, ttype, source)
    )",
    "CREATE TABLE IF NOT EXISTS calls (
        app_id TEXT NOT NULL,
        id TEXT NOT NULL,
        route TEXT,
        status TEXT NOT NULL,
        doc TEXT NOT NULL,
        PRIMARY KEY (app_id, id)
    )",
    "CREATE TABLE IF NOT EXISTS logs (
        app_id TEXT NOT NULL,
        call_id TEXT NOT NULL,
        log TEXT NOT NULL,
        PRIMARY KEY (app_id, call_id)
    )",
];

/// Catalog + log store on a sqlite pool.
#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Upstream(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Error::upstream)
}

fn decode<T: DeserializeOwned>(doc: &str) -> Result<T> {
    serde_json::from_str(doc).map_err(Error::upstream)
}

impl SqlStore {
    /// Connect and apply the schema. Accepts `sqlite::memory:` and
    /// `sqlite://` file URLs; files are created on first use.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::Fatal(format!("db-url {url:?}: {e}")))?
            .create_if_missing(true);
        // An in-memory database exists per connection; more than one
        // connection would shard the catalog.
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::Fatal(format!("connecting to {url:?}: {e}")))?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await.map_err(db_err)?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Page over `table` ordered by `key_col`, optionally scoped by one
    /// equality filter, decoding the `doc` column.
    async fn page<T: DeserializeOwned>(
        &self,
        table: &str,
        key_col: &str,
        scope: Option<(&str, &str)>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<T>> {
        let mut sql = format!("SELECT {key_col}, doc FROM {table} WHERE 1=1");
        if let Some((col, _)) = scope {
            sql.push_str(&format!(" AND {col} = ?"));
        }
        if cursor.is_some() {
            sql.push_str(&format!(" AND {key_col} > ?"));
        }
        sql.push_str(&format!(" ORDER BY {key_col} LIMIT ?"));

        let mut query = sqlx::query(&sql);
        if let Some((_, value)) = scope {
            query = query.bind(value.to_string());
        }
        if let Some(cursor) = cursor {
            query = query.bind(cursor.to_string());
        }
        // Fetch one extra row to learn whether another page exists.
        query = query.bind((limit + 1) as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        let has_more = rows.len() > limit;
        let mut items = Vec::with_capacity(limit.min(rows.len()));
        let mut last_key = None;
        for row in rows.into_iter().take(limit) {
            last_key = Some(row.try_get::<String, _>(0).map_err(db_err)?);
            items.push(decode(&row.try_get::<String, _>(1).map_err(db_err)?)?);
        }
        Ok(Page {
            items,
            next_cursor: if has_more { last_key } else { None },
        })
    }
}

#[async_trait]
impl Datastore for SqlStore {
    async fn insert_app(&self, app: App) -> Result<App> {
        app.validate()?;
        sqlx::query("INSERT INTO apps (id, name, doc) VALUES (?, ?, ?)")
            .bind(&app.id)
            .bind(&app.name)
            .bind(encode(&app)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("app {}", app.name))
                } else {
                    db_err(e)
                }
            })?;
        Ok(app)
    }

    async fn update_app(&self, app: App) -> Result<App> {
        app.validate()?;
        let done = sqlx::query("UPDATE apps SET doc = ? WHERE name = ?")
            .bind(encode(&app)?)
            .bind(&app.name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("app {}", app.name)));
        }
        Ok(app)
    }

    async fn get_app_by_id(&self, id: &str) -> Result<App> {
        sqlx::query("SELECT doc FROM apps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("app {id}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn get_app_by_name(&self, name: &str) -> Result<App> {
        sqlx::query("SELECT doc FROM apps WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("app {name}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn list_apps(&self, cursor: Option<&str>, limit: usize) -> Result<Page<App>> {
        self.page("apps", "name", None, cursor, limit).await
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        let app = self.get_app_by_id(id).await?;
        sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM routes WHERE app_name = ?")
            .bind(&app.name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM fns WHERE app_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM triggers WHERE app_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_route(&self, route: Route) -> Result<Route> {
        route.validate()?;
        self.get_app_by_name(&route.app_name).await?;
        sqlx::query("INSERT INTO routes (app_name, path, doc) VALUES (?, ?, ?)")
            .bind(&route.app_name)
            .bind(&route.path)
            .bind(encode(&route)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("route {}", route.path))
                } else {
                    db_err(e)
                }
            })?;
        Ok(route)
    }

    async fn update_route(&self, route: Route) -> Result<Route> {
        route.validate()?;
        let done = sqlx::query("UPDATE routes SET doc = ? WHERE app_name = ? AND path = ?")
            .bind(encode(&route)?)
            .bind(&route.app_name)
            .bind(&route.path)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("route {}", route.path)));
        }
        Ok(route)
    }

    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route> {
        sqlx::query("SELECT doc FROM routes WHERE app_name = ? AND path = ?")
            .bind(app_name)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("route {path}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn list_routes(
        &self,
        app_name: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Route>> {
        self.page("routes", "path", Some(("app_name", app_name)), cursor, limit)
            .await
    }

    async fn delete_route(&self, app_name: &str, path: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM routes WHERE app_name = ? AND path = ?")
            .bind(app_name)
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("route {path}")));
        }
        Ok(())
    }

    async fn insert_fn(&self, f: Func) -> Result<Func> {
        f.validate()?;
        self.get_app_by_id(&f.app_id).await?;
        sqlx::query("INSERT INTO fns (id, app_id, name, doc) VALUES (?, ?, ?, ?)")
            .bind(&f.id)
            .bind(&f.app_id)
            .bind(&f.name)
            .bind(encode(&f)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("fn {}", f.name))
                } else {
                    db_err(e)
                }
            })?;
        Ok(f)
    }

    async fn update_fn(&self, f: Func) -> Result<Func> {
        f.validate()?;
        let done = sqlx::query("UPDATE fns SET doc = ? WHERE id = ?")
            .bind(encode(&f)?)
            .bind(&f.id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("fn {}", f.id)));
        }
        Ok(f)
    }

    async fn get_fn(&self, id: &str) -> Result<Func> {
        sqlx::query("SELECT doc FROM fns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("fn {id}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn list_fns(&self, app_id: &str, cursor: Option<&str>, limit: usize) -> Result<Page<Func>> {
        self.page("fns", "id", Some(("app_id", app_id)), cursor, limit)
            .await
    }

    async fn delete_fn(&self, id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM fns WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("fn {id}")));
        }
        sqlx::query("DELETE FROM triggers WHERE fn_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .ok();
        Ok(())
    }

    async fn insert_trigger(&self, t: Trigger) -> Result<Trigger> {
        t.validate()?;
        self.get_app_by_id(&t.app_id).await?;
        self.get_fn(&t.fn_id).await?;
        sqlx::query(
            "INSERT INTO triggers (id, app_id, fn_id, name, ttype, source, doc)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&t.id)
        .bind(&t.app_id)
        .bind(&t.fn_id)
        .bind(&t.name)
        .bind(t.trigger_type.as_str())
        .bind(&t.source)
        .bind(encode(&t)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("trigger {}", t.name))
            } else {
                db_err(e)
            }
        })?;
        Ok(t)
    }

    async fn update_trigger(&self, t: Trigger) -> Result<Trigger> {
        t.validate()?;
        let done = sqlx::query("UPDATE triggers SET doc = ?, source = ? WHERE id = ?")
            .bind(encode(&t)?)
            .bind(&t.source)
            .bind(&t.id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("trigger {}", t.id)));
        }
        Ok(t)
    }

    async fn get_trigger(&self, id: &str) -> Result<Trigger> {
        sqlx::query("SELECT doc FROM triggers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("trigger {id}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger> {
        sqlx::query("SELECT doc FROM triggers WHERE app_id = ? AND ttype = ? AND source = ?")
            .bind(app_id)
            .bind(trigger_type.as_str())
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("trigger {source}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn list_triggers(
        &self,
        app_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Trigger>> {
        self.page("triggers", "id", Some(("app_id", app_id)), cursor, limit)
            .await
    }

    async fn delete_trigger(&self, id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM triggers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("trigger {id}")));
        }
        Ok(())
    }

    async fn insert_call(&self, call: &Call) -> Result<()> {
        sqlx::query(
            "INSERT INTO calls (app_id, id, route, status, doc) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (app_id, id) DO UPDATE SET doc = excluded.doc, status = excluded.status
             WHERE calls.status NOT IN ('success', 'error', 'timeout', 'cancelled')",
        )
        .bind(&call.app_id)
        .bind(&call.id)
        .bind(&call.route)
        .bind(call.status.as_str())
        .bind(encode(call)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_call(&self, call: &Call) -> Result<()> {
        // A terminal record never changes; redelivered async attempts
        // must not overwrite a completed one.
        let done = sqlx::query(
            "UPDATE calls SET doc = ?, status = ?
             WHERE app_id = ? AND id = ?
               AND status NOT IN ('success', 'error', 'timeout', 'cancelled')",
        )
        .bind(encode(call)?)
        .bind(call.status.as_str())
        .bind(&call.app_id)
        .bind(&call.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if done.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM calls WHERE app_id = ? AND id = ?")
                .bind(&call.app_id)
                .bind(&call.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            if exists.is_none() {
                return self.insert_call(call).await;
            }
        }
        Ok(())
    }

    async fn get_call(&self, app_id: &str, call_id: &str) -> Result<Call> {
        sqlx::query("SELECT doc FROM calls WHERE app_id = ? AND id = ?")
            .bind(app_id)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))
            .and_then(|row| decode(&row.try_get::<String, _>(0).map_err(db_err)?))
    }

    async fn list_calls(&self, filter: &CallFilter) -> Result<Page<Call>> {
        let mut sql = String::from("SELECT id, doc FROM calls WHERE app_id = ?");
        if filter.route.is_some() {
            sql.push_str(" AND route = ?");
        }
        if filter.cursor.is_some() {
            sql.push_str(" AND id > ?");
        }
        sql.push_str(" ORDER BY id LIMIT ?");

        let mut query = sqlx::query(&sql).bind(&filter.app_id);
        if let Some(route) = &filter.route {
            query = query.bind(route);
        }
        if let Some(cursor) = &filter.cursor {
            query = query.bind(cursor);
        }
        query = query.bind((filter.per_page + 1) as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        let has_more = rows.len() > filter.per_page;
        let mut items = Vec::with_capacity(filter.per_page.min(rows.len()));
        let mut last_key = None;
        for row in rows.into_iter().take(filter.per_page) {
            last_key = Some(row.try_get::<String, _>(0).map_err(db_err)?);
            items.push(decode(&row.try_get::<String, _>(1).map_err(db_err)?)?);
        }
        Ok(Page {
            items,
            next_cursor: if has_more { last_key } else { None },
        })
    }
}

#[async_trait]
impl LogStore for SqlStore {
    async fn insert_log(&self, app_id: &str, call_id: &str, log: Bytes) -> Result<()> {
        sqlx::query(
            "INSERT INTO logs (app_id, call_id, log) VALUES (?, ?, ?)
             ON CONFLICT (app_id, call_id) DO UPDATE SET log = excluded.log",
        )
        .bind(app_id)
        .bind(call_id)
        .bind(base64::engine::general_purpose::STANDARD.encode(&log))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_log(&self, app_id: &str, call_id: &str) -> Result<Bytes> {
        let row = sqlx::query("SELECT log FROM logs WHERE app_id = ? AND call_id = ?")
            .bind(app_id)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("log for call {call_id}")))?;
        let encoded: String = row.try_get(0).map_err(db_err)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(Error::upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqlStore {
        SqlStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn app_round_trip_and_cascade() {
        let ds = store().await;
        let app = ds.insert_app(App::new("myapp")).await.unwrap();
        assert_eq!(ds.get_app_by_name("myapp").await.unwrap().id, app.id);

        let f = ds.insert_fn(Func::new(&app.id, "f1", "img")).await.unwrap();
        ds.insert_trigger(Trigger::new(&app.id, &f.id, "t1", "/hook"))
            .await
            .unwrap();

        ds.delete_app(&app.id).await.unwrap();
        assert!(matches!(
            ds.get_app_by_id(&app.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(ds.get_fn(&f.id).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let ds = store().await;
        ds.insert_app(App::new("a")).await.unwrap();
        assert!(matches!(
            ds.insert_app(App::new("a")).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn list_apps_pages_by_name() {
        let ds = store().await;
        for name in ["a", "b", "c"] {
            ds.insert_app(App::new(name)).await.unwrap();
        }
        let page = ds.list_apps(None, 2).await.unwrap();
        assert_eq!(page.items.len(), 2);
        let rest = ds
            .list_apps(page.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.next_cursor.is_none());
    }

    #[tokio::test]
    async fn call_terminal_status_sticks() {
        let ds = store().await;
        let mut call = Call::new("app1", "a");
        call.status = funcd_core::models::CallStatus::Success;
        ds.insert_call(&call).await.unwrap();

        call.status = funcd_core::models::CallStatus::Error;
        ds.update_call(&call).await.unwrap();
        assert_eq!(
            ds.get_call("app1", &call.id).await.unwrap().status,
            funcd_core::models::CallStatus::Success
        );
    }

    #[tokio::test]
    async fn log_blob_round_trip() {
        let ds = store().await;
        ds.insert_log("a", "c", Bytes::from_static(b"\x00\x01binary"))
            .await
            .unwrap();
        assert_eq!(
            ds.get_log("a", "c").await.unwrap(),
            Bytes::from_static(b"\x00\x01binary")
        );
    }
}

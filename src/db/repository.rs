//! CRUD repository over the asset store.
//!
//! Every public method opens its own connection via the shared
//! [`StorageEngine`], performs one logical operation and drops the handle,
//! so a repository can be cloned into worker threads freely.

use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use super::{
    format_timestamp, parse_metadata, parse_timestamp, serialize_metadata, Asset,
    AssetRelationship, AssetUpdate, ContainerVersion, Customization, StorageEngine,
};
use crate::error::{Error, Result};
use crate::metadata::JsonMap;

#[derive(Clone)]
pub struct AssetRepository {
    engine: Arc<StorageEngine>,
}

impl AssetRepository {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(StorageEngine::open(db_path)?)))
    }

    /// Open the database at the default location under the user's home.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::config::default_db_path())
    }

    /// Fresh private in-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(StorageEngine::in_memory()?)))
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.engine.path()
    }

    // ========================================================================
    // Asset CRUD
    // ========================================================================

    pub fn create_asset(
        &self,
        path: &str,
        label: Option<&str>,
        metadata: Option<&JsonMap>,
        tags: Option<&[String]>,
    ) -> Result<Asset> {
        let normalized_path = normalize_path(path)?;
        let normalized_label = match label {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => normalized_path.clone(),
        };
        let normalized_tags = normalize_tags(tags.unwrap_or(&[]))?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;
        conn.execute(
            r#"
            INSERT INTO assets(path, label, metadata, created_at, updated_at)
            VALUES(?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                normalized_path,
                normalized_label,
                serialize_metadata(metadata),
                now,
                now
            ],
        )
        .map_err(|e| map_duplicate_path(e, &normalized_path))?;
        let asset_id = conn.last_insert_rowid();

        if !normalized_tags.is_empty() {
            replace_tags(&conn, asset_id, &normalized_tags)?;
        }

        self.fetch_asset(&conn, asset_id)?
            .ok_or_else(|| Error::not_found(format!("asset {asset_id}")))
    }

    /// Return the asset stored at `path`, creating a placeholder row when
    /// none exists. Never fails on a concurrent duplicate insert.
    pub fn ensure_asset(
        &self,
        path: &str,
        label: Option<&str>,
        metadata: Option<&JsonMap>,
    ) -> Result<Asset> {
        if let Some(existing) = self.get_asset_by_path(path)? {
            return Ok(existing);
        }
        match self.create_asset(path, label, metadata, None) {
            Ok(asset) => Ok(asset),
            // Another worker can win the insert between the lookup and here.
            Err(Error::DuplicatePath(_)) => self
                .get_asset_by_path(path)?
                .ok_or_else(|| Error::not_found(format!("asset at {path}"))),
            Err(e) => Err(e),
        }
    }

    pub fn get_asset(&self, asset_id: i64) -> Result<Option<Asset>> {
        let conn = self.engine.connect()?;
        self.fetch_asset(&conn, asset_id)
    }

    pub fn get_asset_by_path(&self, path: &str) -> Result<Option<Asset>> {
        let normalized_path = normalize_path(path)?;
        let conn = self.engine.connect()?;
        let result = conn.query_row(
            "SELECT id, path, label, metadata, created_at, updated_at FROM assets WHERE path = ?",
            [normalized_path],
            asset_row,
        );
        match result {
            Ok(row) => {
                let tags = fetch_tags(&conn, row.id)?;
                Ok(Some(row.into_asset(tags)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored asset, ordered by path case-insensitively.
    pub fn list_assets(&self) -> Result<Vec<Asset>> {
        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, path, label, metadata, created_at, updated_at FROM assets \
             ORDER BY path COLLATE NOCASE",
        )?;
        let rows: Vec<AssetRow> = stmt
            .query_map([], asset_row)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        rows_to_assets(&conn, rows)
    }

    /// Apply a partial update and return the refreshed asset.
    pub fn update_asset(&self, asset_id: i64, update: AssetUpdate) -> Result<Asset> {
        let normalized_path = update.path.as_deref().map(normalize_path).transpose()?;
        let serialized_metadata = update
            .metadata
            .as_ref()
            .map(|m| serialize_metadata(Some(m)));
        let normalized_tags = update
            .tags
            .as_deref()
            .map(normalize_tags)
            .transpose()?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(ref path) = normalized_path {
            sets.push("path = ?");
            values.push(path);
        }
        if let Some(ref label) = update.label {
            sets.push("label = ?");
            values.push(label);
        }
        if let Some(ref metadata) = serialized_metadata {
            sets.push("metadata = ?");
            values.push(metadata);
        }

        let touched_columns = !sets.is_empty();
        if touched_columns {
            sets.push("updated_at = ?");
            values.push(&now);
            values.push(&asset_id);
            let sql = format!("UPDATE assets SET {} WHERE id = ?", sets.join(", "));
            conn.execute(&sql, &values[..]).map_err(|e| match normalized_path {
                Some(ref path) => map_duplicate_path(e, path),
                None => e.into(),
            })?;
        }

        if let Some(tags) = normalized_tags {
            replace_tags(&conn, asset_id, &tags)?;
            prune_unused_tags(&conn)?;
            if !touched_columns {
                conn.execute(
                    "UPDATE assets SET updated_at = ? WHERE id = ?",
                    rusqlite::params![now, asset_id],
                )?;
            }
        }

        self.fetch_asset(&conn, asset_id)?
            .ok_or_else(|| Error::not_found(format!("asset {asset_id}")))
    }

    pub fn delete_asset(&self, asset_id: i64) -> Result<bool> {
        let conn = self.engine.connect()?;
        let deleted = conn.execute("DELETE FROM assets WHERE id = ?", [asset_id])? > 0;
        if deleted {
            prune_unused_tags(&conn)?;
        }
        Ok(deleted)
    }

    pub fn delete_asset_by_path(&self, path: &str) -> Result<bool> {
        let normalized_path = normalize_path(path)?;
        let conn = self.engine.connect()?;
        let deleted = conn.execute("DELETE FROM assets WHERE path = ?", [normalized_path])? > 0;
        if deleted {
            prune_unused_tags(&conn)?;
        }
        Ok(deleted)
    }

    // ========================================================================
    // Tag operations
    // ========================================================================

    /// Replace all tags on an asset, returning the normalized set.
    pub fn set_tags(&self, asset_id: i64, tags: &[String]) -> Result<Vec<String>> {
        let normalized = normalize_tags(tags)?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;
        self.require_asset(&conn, asset_id)?;
        replace_tags(&conn, asset_id, &normalized)?;
        conn.execute(
            "UPDATE assets SET updated_at = ? WHERE id = ?",
            rusqlite::params![now, asset_id],
        )?;
        prune_unused_tags(&conn)?;
        Ok(normalized)
    }

    /// Add one tag; `None` means the asset already carried it (matched
    /// case-insensitively).
    pub fn add_tag(&self, asset_id: i64, tag: &str) -> Result<Option<String>> {
        let normalized = normalize_tag(tag)?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;
        self.require_asset(&conn, asset_id)?;
        let tag_id = ensure_tag_id(&conn, &normalized)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO asset_tag_links(asset_id, tag_id) VALUES(?, ?)",
            rusqlite::params![asset_id, tag_id],
        )?;
        if inserted > 0 {
            conn.execute(
                "UPDATE assets SET updated_at = ? WHERE id = ?",
                rusqlite::params![now, asset_id],
            )?;
            Ok(Some(normalized))
        } else {
            Ok(None)
        }
    }

    pub fn remove_tag(&self, asset_id: i64, tag: &str) -> Result<bool> {
        let normalized = normalize_tag(tag)?;

        let conn = self.engine.connect()?;
        let Some(tag_id) = tag_id_for_name(&conn, &normalized)? else {
            return Ok(false);
        };
        let removed = conn.execute(
            "DELETE FROM asset_tag_links WHERE asset_id = ? AND tag_id = ?",
            rusqlite::params![asset_id, tag_id],
        )?;
        if removed > 0 {
            conn.execute(
                "UPDATE assets SET updated_at = ? WHERE id = ?",
                rusqlite::params![format_timestamp(Utc::now()), asset_id],
            )?;
            prune_unused_tags(&conn)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Rename a tag on one asset. Returns `None` when the old tag is not on
    /// the asset or the new name already is.
    pub fn rename_tag(&self, asset_id: i64, old_tag: &str, new_tag: &str) -> Result<Option<String>> {
        let normalized_old = normalize_tag(old_tag)?;
        let normalized_new = normalize_tag(new_tag)?;

        let conn = self.engine.connect()?;
        let Some(old_tag_id) = tag_id_for_name(&conn, &normalized_old)? else {
            return Ok(None);
        };
        if !link_exists(&conn, asset_id, old_tag_id)? {
            return Ok(None);
        }

        let new_tag_id = ensure_tag_id(&conn, &normalized_new)?;
        if new_tag_id != old_tag_id && link_exists(&conn, asset_id, new_tag_id)? {
            return Ok(None);
        }

        conn.execute(
            "UPDATE asset_tag_links SET tag_id = ? WHERE asset_id = ? AND tag_id = ?",
            rusqlite::params![new_tag_id, asset_id, old_tag_id],
        )?;
        conn.execute(
            "UPDATE assets SET updated_at = ? WHERE id = ?",
            rusqlite::params![format_timestamp(Utc::now()), asset_id],
        )?;
        prune_unused_tags(&conn)?;
        Ok(Some(normalized_new))
    }

    pub fn tags_for_path(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .get_asset_by_path(path)?
            .map(|asset| asset.tags)
            .unwrap_or_default())
    }

    /// Assets whose tag text contains `query`, case-insensitively. An empty
    /// query returns every tagged asset.
    pub fn search_tags(&self, query: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let needle = query.trim().to_lowercase();
        let mut results: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (path, tag) in self.tag_pairs()? {
            if !needle.is_empty() && !tag.to_lowercase().contains(&needle) {
                continue;
            }
            results.entry(path).or_default().push(tag);
        }

        Ok(results)
    }

    pub fn all_tags(&self) -> Result<Vec<String>> {
        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare("SELECT name FROM tags ORDER BY name COLLATE NOCASE")?;
        let tags = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    /// `(path, tags)` pairs for every asset with at least one tag, in path
    /// order.
    pub fn iter_tagged_assets(&self) -> Result<Vec<(String, Vec<String>)>> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for (path, tag) in self.tag_pairs()? {
            match grouped.last_mut() {
                Some((current, bucket)) if *current == path => bucket.push(tag),
                _ => grouped.push((path, vec![tag])),
            }
        }
        Ok(grouped)
    }

    /// Paths carrying `tag`, matched case-insensitively.
    pub fn paths_for_tag(&self, tag: &str) -> Result<Vec<String>> {
        let normalized = normalize_tag(tag)?;
        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(
            "SELECT assets.path FROM assets \
             JOIN asset_tag_links ON asset_tag_links.asset_id = assets.id \
             JOIN tags ON tags.id = asset_tag_links.tag_id \
             WHERE tags.name = ? \
             ORDER BY assets.path COLLATE NOCASE",
        )?;
        let paths = stmt
            .query_map([normalized], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(paths)
    }

    fn tag_pairs(&self) -> Result<Vec<(String, String)>> {
        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(
            "SELECT assets.path, tags.name FROM assets \
             JOIN asset_tag_links ON asset_tag_links.asset_id = assets.id \
             JOIN tags ON tags.id = asset_tag_links.tag_id \
             ORDER BY assets.path COLLATE NOCASE, tags.name COLLATE NOCASE",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(pairs)
    }

    // ========================================================================
    // Customizations and lineage relationships
    // ========================================================================

    pub fn create_customization(
        &self,
        base_asset_id: i64,
        backend_identifier: &str,
        parameter_schema: Option<&JsonMap>,
        parameter_values: Option<&JsonMap>,
    ) -> Result<Customization> {
        let backend = normalize_required(backend_identifier, "backend identifier")?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;
        // Cross-references are soft, so existence is enforced here.
        self.require_asset(&conn, base_asset_id)?;
        conn.execute(
            r#"
            INSERT INTO customizations(
                base_asset_id,
                backend_identifier,
                parameter_schema,
                parameter_values,
                created_at,
                updated_at
            ) VALUES(?, ?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                base_asset_id,
                backend,
                serialize_metadata(parameter_schema),
                serialize_metadata(parameter_values),
                now,
                now
            ],
        )?;
        let customization_id = conn.last_insert_rowid();

        self.fetch_customization(&conn, customization_id)?
            .ok_or_else(|| Error::not_found(format!("customization {customization_id}")))
    }

    pub fn get_customization(&self, customization_id: i64) -> Result<Option<Customization>> {
        let conn = self.engine.connect()?;
        self.fetch_customization(&conn, customization_id)
    }

    pub fn list_customizations_for_asset(&self, base_asset_id: i64) -> Result<Vec<Customization>> {
        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, base_asset_id, backend_identifier, parameter_schema, parameter_values, \
                    created_at, updated_at \
             FROM customizations WHERE base_asset_id = ? ORDER BY created_at ASC, id ASC",
        )?;
        let customizations = stmt
            .query_map([base_asset_id], customization_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(customizations)
    }

    pub fn update_customization(
        &self,
        customization_id: i64,
        backend_identifier: Option<&str>,
        parameter_schema: Option<&JsonMap>,
        parameter_values: Option<&JsonMap>,
    ) -> Result<Customization> {
        let backend = backend_identifier
            .map(|b| normalize_required(b, "backend identifier"))
            .transpose()?;
        let serialized_schema = parameter_schema.map(|m| serialize_metadata(Some(m)));
        let serialized_values = parameter_values.map(|m| serialize_metadata(Some(m)));
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(ref backend) = backend {
            sets.push("backend_identifier = ?");
            values.push(backend);
        }
        if let Some(ref schema) = serialized_schema {
            sets.push("parameter_schema = ?");
            values.push(schema);
        }
        if let Some(ref params) = serialized_values {
            sets.push("parameter_values = ?");
            values.push(params);
        }

        if !sets.is_empty() {
            sets.push("updated_at = ?");
            values.push(&now);
            values.push(&customization_id);
            let sql = format!("UPDATE customizations SET {} WHERE id = ?", sets.join(", "));
            conn.execute(&sql, &values[..])?;
        }

        self.fetch_customization(&conn, customization_id)?
            .ok_or_else(|| Error::not_found(format!("customization {customization_id}")))
    }

    pub fn delete_customization(&self, customization_id: i64) -> Result<bool> {
        let conn = self.engine.connect()?;
        let deleted = conn.execute(
            "DELETE FROM customizations WHERE id = ?",
            [customization_id],
        )?;
        Ok(deleted > 0)
    }

    /// Create or refresh the relationship between a customization and one
    /// derivative asset. Re-recording the same triple refreshes
    /// `updated_at` instead of inserting a duplicate.
    pub fn create_asset_relationship(
        &self,
        customization_id: i64,
        derivative_asset_id: i64,
        relationship_type: &str,
    ) -> Result<AssetRelationship> {
        let normalized_type = normalize_required(relationship_type, "relationship type")?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;
        let customization = self
            .fetch_customization(&conn, customization_id)?
            .ok_or_else(|| Error::not_found(format!("customization {customization_id}")))?;

        conn.execute(
            r#"
            INSERT INTO asset_relationships(
                base_asset_id,
                customization_id,
                derivative_asset_id,
                relationship_type,
                created_at,
                updated_at
            ) VALUES(?, ?, ?, ?, ?, ?)
            ON CONFLICT(customization_id, derivative_asset_id, relationship_type)
            DO UPDATE SET
                base_asset_id = excluded.base_asset_id,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                customization.base_asset_id,
                customization_id,
                derivative_asset_id,
                normalized_type,
                now,
                now
            ],
        )?;

        let relationship = conn.query_row(
            "SELECT id, base_asset_id, customization_id, derivative_asset_id, relationship_type, \
                    created_at, updated_at \
             FROM asset_relationships \
             WHERE customization_id = ? AND derivative_asset_id = ? AND relationship_type = ?",
            rusqlite::params![customization_id, derivative_asset_id, normalized_type],
            relationship_row,
        )?;
        Ok(relationship)
    }

    pub fn list_relationships_for_base_asset(
        &self,
        base_asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Vec<AssetRelationship>> {
        self.list_relationships("base_asset_id", base_asset_id, relationship_type)
    }

    pub fn list_relationships_for_derivative_asset(
        &self,
        derivative_asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Vec<AssetRelationship>> {
        self.list_relationships("derivative_asset_id", derivative_asset_id, relationship_type)
    }

    fn list_relationships(
        &self,
        column: &str,
        asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Vec<AssetRelationship>> {
        let normalized_type = relationship_type
            .map(|t| normalize_required(t, "relationship type"))
            .transpose()?;

        let mut sql = format!(
            "SELECT id, base_asset_id, customization_id, derivative_asset_id, relationship_type, \
                    created_at, updated_at \
             FROM asset_relationships WHERE {column} = ?"
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&asset_id];
        if let Some(ref kind) = normalized_type {
            sql.push_str(" AND relationship_type = ?");
            params.push(kind);
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let relationships = stmt
            .query_map(&params[..], relationship_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(relationships)
    }

    pub fn delete_asset_relationship(&self, relationship_id: i64) -> Result<bool> {
        let conn = self.engine.connect()?;
        let deleted = conn.execute(
            "DELETE FROM asset_relationships WHERE id = ?",
            [relationship_id],
        )?;
        Ok(deleted > 0)
    }

    /// Derivative assets produced from `base_asset_id`, ordered by path.
    pub fn list_derivatives_for_asset(
        &self,
        base_asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Vec<Asset>> {
        let normalized_type = relationship_type
            .map(|t| normalize_required(t, "relationship type"))
            .transpose()?;

        let mut sql = String::from(
            "SELECT assets.id, assets.path, assets.label, assets.metadata, \
                    assets.created_at, assets.updated_at \
             FROM asset_relationships \
             JOIN assets ON assets.id = asset_relationships.derivative_asset_id \
             WHERE asset_relationships.base_asset_id = ?",
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&base_asset_id];
        if let Some(ref kind) = normalized_type {
            sql.push_str(" AND asset_relationships.relationship_type = ?");
            params.push(kind);
        }
        sql.push_str(" ORDER BY assets.path COLLATE NOCASE");

        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<AssetRow> = stmt
            .query_map(&params[..], asset_row)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        rows_to_assets(&conn, rows)
    }

    /// The originating asset for a derivative, most recently recorded edge
    /// first.
    pub fn get_base_for_derivative(
        &self,
        derivative_asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Option<Asset>> {
        let normalized_type = relationship_type
            .map(|t| normalize_required(t, "relationship type"))
            .transpose()?;

        let mut sql = String::from(
            "SELECT assets.id, assets.path, assets.label, assets.metadata, \
                    assets.created_at, assets.updated_at \
             FROM asset_relationships \
             JOIN assets ON assets.id = asset_relationships.base_asset_id \
             WHERE asset_relationships.derivative_asset_id = ?",
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&derivative_asset_id];
        if let Some(ref kind) = normalized_type {
            sql.push_str(" AND asset_relationships.relationship_type = ?");
            params.push(kind);
        }
        sql.push_str(" ORDER BY asset_relationships.updated_at DESC, asset_relationships.id DESC LIMIT 1");

        let conn = self.engine.connect()?;
        let result = conn.query_row(&sql, &params[..], asset_row);
        match result {
            Ok(row) => {
                let tags = fetch_tags(&conn, row.id)?;
                Ok(Some(row.into_asset(tags)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Container versions
    // ========================================================================

    /// Snapshot a container's metadata document under a unique name. When no
    /// explicit document is supplied the container's current metadata is
    /// captured.
    pub fn create_container_version(
        &self,
        container_asset_id: i64,
        name: &str,
        metadata: Option<&JsonMap>,
        notes: Option<&str>,
        source_version_id: Option<i64>,
    ) -> Result<ContainerVersion> {
        let normalized_name = normalize_required(name, "version name")?;
        let now = format_timestamp(Utc::now());

        let conn = self.engine.connect()?;
        let container = self
            .fetch_asset(&conn, container_asset_id)?
            .ok_or_else(|| Error::not_found(format!("asset {container_asset_id}")))?;
        let snapshot = match metadata {
            Some(map) => map.clone(),
            None => container.metadata,
        };

        conn.execute(
            r#"
            INSERT INTO container_versions(
                container_asset_id,
                name,
                metadata,
                notes,
                source_version_id,
                created_at
            ) VALUES(?, ?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                container_asset_id,
                normalized_name,
                serialize_metadata(Some(&snapshot)),
                notes,
                source_version_id,
                now
            ],
        )
        .map_err(|e| map_duplicate_version(e, &normalized_name))?;
        let version_id = conn.last_insert_rowid();

        self.fetch_container_version(&conn, version_id)?
            .ok_or_else(|| Error::not_found(format!("container version {version_id}")))
    }

    pub fn get_container_version(&self, version_id: i64) -> Result<Option<ContainerVersion>> {
        let conn = self.engine.connect()?;
        self.fetch_container_version(&conn, version_id)
    }

    /// Versions for one container in creation order.
    pub fn list_container_versions(&self, container_asset_id: i64) -> Result<Vec<ContainerVersion>> {
        let conn = self.engine.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, container_asset_id, name, metadata, notes, source_version_id, created_at \
             FROM container_versions WHERE container_asset_id = ? \
             ORDER BY created_at ASC, id ASC",
        )?;
        let versions = stmt
            .query_map([container_asset_id], container_version_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(versions)
    }

    pub fn get_latest_container_version(
        &self,
        container_asset_id: i64,
    ) -> Result<Option<ContainerVersion>> {
        let conn = self.engine.connect()?;
        let result = conn.query_row(
            "SELECT id, container_asset_id, name, metadata, notes, source_version_id, created_at \
             FROM container_versions WHERE container_asset_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [container_asset_id],
            container_version_row,
        );
        match result {
            Ok(version) => Ok(Some(version)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Renaming is the only mutation a stored version permits.
    pub fn rename_container_version(
        &self,
        version_id: i64,
        new_name: &str,
    ) -> Result<ContainerVersion> {
        let normalized_name = normalize_required(new_name, "version name")?;

        let conn = self.engine.connect()?;
        let changed = conn
            .execute(
                "UPDATE container_versions SET name = ? WHERE id = ?",
                rusqlite::params![normalized_name, version_id],
            )
            .map_err(|e| map_duplicate_version(e, &normalized_name))?;
        if changed == 0 {
            return Err(Error::not_found(format!("container version {version_id}")));
        }

        self.fetch_container_version(&conn, version_id)?
            .ok_or_else(|| Error::not_found(format!("container version {version_id}")))
    }

    pub fn delete_container_version(&self, version_id: i64) -> Result<bool> {
        let conn = self.engine.connect()?;
        let deleted = conn.execute("DELETE FROM container_versions WHERE id = ?", [version_id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Row fetch helpers
    // ========================================================================

    fn fetch_asset(&self, conn: &Connection, asset_id: i64) -> Result<Option<Asset>> {
        let result = conn.query_row(
            "SELECT id, path, label, metadata, created_at, updated_at FROM assets WHERE id = ?",
            [asset_id],
            asset_row,
        );
        match result {
            Ok(row) => {
                let tags = fetch_tags(conn, asset_id)?;
                Ok(Some(row.into_asset(tags)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn require_asset(&self, conn: &Connection, asset_id: i64) -> Result<()> {
        let result = conn.query_row("SELECT 1 FROM assets WHERE id = ?", [asset_id], |_| Ok(()));
        match result {
            Ok(()) => Ok(()),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::not_found(format!("asset {asset_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fetch_customization(
        &self,
        conn: &Connection,
        customization_id: i64,
    ) -> Result<Option<Customization>> {
        let result = conn.query_row(
            "SELECT id, base_asset_id, backend_identifier, parameter_schema, parameter_values, \
                    created_at, updated_at \
             FROM customizations WHERE id = ?",
            [customization_id],
            customization_row,
        );
        match result {
            Ok(customization) => Ok(Some(customization)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fetch_container_version(
        &self,
        conn: &Connection,
        version_id: i64,
    ) -> Result<Option<ContainerVersion>> {
        let result = conn.query_row(
            "SELECT id, container_asset_id, name, metadata, notes, source_version_id, created_at \
             FROM container_versions WHERE id = ?",
            [version_id],
            container_version_row,
        );
        match result {
            Ok(version) => Ok(Some(version)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

struct AssetRow {
    id: i64,
    path: String,
    label: String,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
}

impl AssetRow {
    fn into_asset(self, tags: Vec<String>) -> Asset {
        Asset {
            id: self.id,
            path: self.path,
            label: self.label,
            metadata: parse_metadata(self.metadata),
            tags,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

fn asset_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRow> {
    Ok(AssetRow {
        id: row.get(0)?,
        path: row.get(1)?,
        label: row.get(2)?,
        metadata: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn customization_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customization> {
    Ok(Customization {
        id: row.get(0)?,
        base_asset_id: row.get(1)?,
        backend_identifier: row.get(2)?,
        parameter_schema: parse_metadata(row.get(3)?),
        parameter_values: parse_metadata(row.get(4)?),
        created_at: parse_timestamp(&row.get::<_, String>(5)?),
        updated_at: parse_timestamp(&row.get::<_, String>(6)?),
    })
}

fn relationship_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRelationship> {
    Ok(AssetRelationship {
        id: row.get(0)?,
        base_asset_id: row.get(1)?,
        customization_id: row.get(2)?,
        derivative_asset_id: row.get(3)?,
        relationship_type: row.get(4)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?),
        updated_at: parse_timestamp(&row.get::<_, String>(6)?),
    })
}

fn container_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerVersion> {
    Ok(ContainerVersion {
        id: row.get(0)?,
        container_asset_id: row.get(1)?,
        name: row.get(2)?,
        metadata: parse_metadata(row.get(3)?),
        notes: row.get(4)?,
        source_version_id: row.get(5)?,
        created_at: parse_timestamp(&row.get::<_, String>(6)?),
    })
}

fn rows_to_assets(conn: &Connection, rows: Vec<AssetRow>) -> Result<Vec<Asset>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let mut tags_map = tags_for_asset_ids(conn, &ids)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let tags = tags_map.remove(&row.id).unwrap_or_default();
            row.into_asset(tags)
        })
        .collect())
}

// ============================================================================
// Tag helpers
// ============================================================================

fn fetch_tags(conn: &Connection, asset_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT tags.name FROM asset_tag_links \
         JOIN tags ON tags.id = asset_tag_links.tag_id \
         WHERE asset_tag_links.asset_id = ? \
         ORDER BY tags.name COLLATE NOCASE",
    )?;
    let tags = stmt
        .query_map([asset_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(tags)
}

fn tags_for_asset_ids(conn: &Connection, asset_ids: &[i64]) -> Result<HashMap<i64, Vec<String>>> {
    if asset_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; asset_ids.len()].join(",");
    let sql = format!(
        "SELECT asset_tag_links.asset_id, tags.name FROM asset_tag_links \
         JOIN tags ON tags.id = asset_tag_links.tag_id \
         WHERE asset_tag_links.asset_id IN ({placeholders}) \
         ORDER BY asset_tag_links.asset_id, tags.name COLLATE NOCASE"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(i64, String)> = stmt
        .query_map(rusqlite::params_from_iter(asset_ids.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .filter_map(|r| r.ok())
        .collect();

    let mut tags_map: HashMap<i64, Vec<String>> = HashMap::new();
    for (asset_id, tag) in rows {
        tags_map.entry(asset_id).or_default().push(tag);
    }
    Ok(tags_map)
}

fn replace_tags(conn: &Connection, asset_id: i64, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM asset_tag_links WHERE asset_id = ?", [asset_id])?;
    for tag in tags {
        let tag_id = ensure_tag_id(conn, tag)?;
        conn.execute(
            "INSERT OR IGNORE INTO asset_tag_links(asset_id, tag_id) VALUES(?, ?)",
            rusqlite::params![asset_id, tag_id],
        )?;
    }
    Ok(())
}

fn ensure_tag_id(conn: &Connection, tag: &str) -> Result<i64> {
    // Matches the NOCASE unique column, so "Rust" and "rust" share a row.
    let result = conn.query_row("SELECT id FROM tags WHERE name = ?", [tag], |row| row.get(0));
    match result {
        Ok(id) => Ok(id),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            conn.execute("INSERT INTO tags(name) VALUES(?)", [tag])?;
            Ok(conn.last_insert_rowid())
        }
        Err(e) => Err(e.into()),
    }
}

fn tag_id_for_name(conn: &Connection, tag: &str) -> Result<Option<i64>> {
    let result = conn.query_row("SELECT id FROM tags WHERE name = ?", [tag], |row| row.get(0));
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn link_exists(conn: &Connection, asset_id: i64, tag_id: i64) -> Result<bool> {
    let result = conn.query_row(
        "SELECT 1 FROM asset_tag_links WHERE asset_id = ? AND tag_id = ?",
        rusqlite::params![asset_id, tag_id],
        |_| Ok(()),
    );
    match result {
        Ok(()) => Ok(true),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn prune_unused_tags(conn: &Connection) -> Result<()> {
    conn.execute(
        "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM asset_tag_links)",
        [],
    )?;
    Ok(())
}

// ============================================================================
// Normalization
// ============================================================================

fn normalize_path(path: &str) -> Result<String> {
    let value = path.trim();
    if value.is_empty() {
        return Err(Error::validation("asset path cannot be empty"));
    }
    Ok(value.to_string())
}

fn normalize_required(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("{what} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn normalize_tag(tag: &str) -> Result<String> {
    let value = tag.trim();
    if value.is_empty() {
        return Err(Error::validation("tags must contain visible characters"));
    }
    Ok(value.to_string())
}

/// Trim, drop case-insensitive duplicates keeping the first spelling, and
/// sort case-insensitively.
fn normalize_tags(tags: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::new();
    for tag in tags {
        let value = normalize_tag(tag)?;
        if seen.insert(value.to_lowercase()) {
            normalized.push(value);
        }
    }
    normalized.sort_by_key(|tag| tag.to_lowercase());
    Ok(normalized)
}

fn map_duplicate_path(err: rusqlite::Error, path: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation
            && message.as_deref().is_some_and(|m| m.contains("assets.path"))
        {
            return Error::DuplicatePath(path.to_string());
        }
    }
    Error::Database(err)
}

fn map_duplicate_version(err: rusqlite::Error, name: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation
            && message
                .as_deref()
                .is_some_and(|m| m.contains("container_versions"))
        {
            return Error::validation(format!(
                "version name {name:?} already exists for this container"
            ));
        }
    }
    Error::Database(err)
}

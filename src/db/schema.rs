pub const SCHEMA: &str = r#"
-- Assets table: one row per tracked filesystem entry (file, container
-- folder, or placeholder). The metadata column holds an open JSON document.
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Normalized tag names, matched case-insensitively.
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE
);

CREATE TABLE IF NOT EXISTS asset_tag_links (
    asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (asset_id, tag_id)
);

-- Named snapshots of a container's metadata document. The container id is a
-- soft reference: version history outlives the asset row on purpose.
CREATE TABLE IF NOT EXISTS container_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    container_asset_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    notes TEXT,
    source_version_id INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (container_asset_id, name)
);

-- Recorded parameter sets applied to a base asset. Soft reference, same
-- reasoning as container_versions.
CREATE TABLE IF NOT EXISTS customizations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_asset_id INTEGER NOT NULL,
    backend_identifier TEXT NOT NULL,
    parameter_schema TEXT NOT NULL DEFAULT '{}',
    parameter_values TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Lineage edges from a base asset through a customization to a derivative.
CREATE TABLE IF NOT EXISTS asset_relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_asset_id INTEGER NOT NULL,
    customization_id INTEGER NOT NULL,
    derivative_asset_id INTEGER NOT NULL,
    relationship_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (customization_id, derivative_asset_id, relationship_type)
);

-- Indexes for common queries
CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name);
CREATE INDEX IF NOT EXISTS idx_asset_tag_links_tag_id ON asset_tag_links(tag_id);
CREATE INDEX IF NOT EXISTS idx_asset_tag_links_asset_id ON asset_tag_links(asset_id);
CREATE INDEX IF NOT EXISTS idx_container_versions_container
    ON container_versions(container_asset_id);
CREATE INDEX IF NOT EXISTS idx_customizations_base_asset_id
    ON customizations(base_asset_id);
CREATE INDEX IF NOT EXISTS idx_customizations_backend_identifier
    ON customizations(backend_identifier);
CREATE INDEX IF NOT EXISTS idx_asset_relationships_base_asset_id
    ON asset_relationships(base_asset_id);
CREATE INDEX IF NOT EXISTS idx_asset_relationships_customization_id
    ON asset_relationships(customization_id);
CREATE INDEX IF NOT EXISTS idx_asset_relationships_derivative_asset_id
    ON asset_relationships(derivative_asset_id);
CREATE INDEX IF NOT EXISTS idx_asset_relationships_relationship_type
    ON asset_relationships(relationship_type);
"#;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{StoreError, is_foreign_key_violation, is_unique_violation};
use crate::models::{
    BackfillSummary, CalendarEntry, GroupKind, IngredientRow, IngredientSource, NewCalendarEntry,
    NewRecipe, NewTagGroup, Recipe, RecipeListing, Tag, TagGroup, TagGroupWithTags, TagRef,
    UpdateTagGroup, User, UserRole,
};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    #[allow(clippy::too_many_lines)]
    fn migrate(&self) -> Result<()> {
        self.conn.pragma_update(None, "foreign_keys", "ON")?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    role TEXT NOT NULL DEFAULT 'viewer'
                        CHECK (role IN ('viewer', 'contributor', 'admin')),
                    token_hash TEXT UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tag_groups (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    display_order INTEGER NOT NULL DEFAULT 0,
                    kind TEXT CHECK (kind IN ('recipe', 'ingredient')),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tag_group_id INTEGER NOT NULL REFERENCES tag_groups(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (tag_group_id, name)
                );

                CREATE TABLE IF NOT EXISTS recipes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slug TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    image_url TEXT,
                    ingredients_text TEXT NOT NULL DEFAULT '',
                    instructions TEXT NOT NULL DEFAULT '',
                    inspiration TEXT NOT NULL DEFAULT '',
                    ingredients_structured TEXT NOT NULL DEFAULT '[]',
                    created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_tags (
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                    PRIMARY KEY (recipe_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                    PRIMARY KEY (recipe_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS user_favorites (
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, recipe_id)
                );

                CREATE TABLE IF NOT EXISTS calendar_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    date TEXT NOT NULL,
                    meal_type TEXT NOT NULL CHECK (meal_type IN ('breakfast', 'lunch', 'dinner')),
                    notes TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (user_id, date, meal_type)
                );

                CREATE INDEX IF NOT EXISTS idx_tags_group ON tags(tag_group_id);
                CREATE INDEX IF NOT EXISTS idx_recipes_created ON recipes(created_at);
                CREATE INDEX IF NOT EXISTS idx_recipe_tags_tag ON recipe_tags(tag_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_tag ON recipe_ingredients(tag_id);
                CREATE INDEX IF NOT EXISTS idx_calendar_user_date ON calendar_entries(user_id, date);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let role: String = row.get(2)?;
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            role: role.parse().map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
            })?,
            created_at: row.get(3)?,
        })
    }

    fn tag_group_from_row(row: &rusqlite::Row) -> rusqlite::Result<TagGroup> {
        let kind: Option<String> = row.get(3)?;
        Ok(TagGroup {
            id: row.get(0)?,
            name: row.get(1)?,
            display_order: row.get(2)?,
            kind: kind.and_then(|k| k.parse::<GroupKind>().ok()),
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn tag_from_row(row: &rusqlite::Row) -> rusqlite::Result<Tag> {
        Ok(Tag {
            id: row.get(0)?,
            tag_group_id: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    // Expects columns in RECIPE_COLUMNS order.
    fn recipe_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recipe> {
        let structured: String = row.get(7)?;
        Ok(Recipe {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            image_url: row.get(3)?,
            ingredients_text: row.get(4)?,
            instructions: row.get(5)?,
            inspiration: row.get(6)?,
            ingredients_structured: parse_structured(&structured),
            created_by: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    // 0: ce.id, 1: ce.user_id, 2: ce.recipe_id, 3: ce.date, 4: ce.meal_type,
    // 5: ce.notes, 6: ce.created_at, 7: ce.updated_at, 8: r.name, 9: r.slug
    fn calendar_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<CalendarEntry> {
        let meal: String = row.get(4)?;
        Ok(CalendarEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            recipe_id: row.get(2)?,
            date: row.get(3)?,
            meal_type: meal.parse().map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
            })?,
            notes: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            recipe_name: row.get(8)?,
            recipe_slug: row.get(9)?,
        })
    }

    // --- Users ---

    pub fn insert_user(&self, email: &str, role: UserRole, token_hash: &str) -> Result<User> {
        let now = Local::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT INTO users (email, role, token_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![email.trim(), role.as_str(), token_hash, now],
        );
        match inserted {
            Ok(_) => self.get_user(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                bail!(StoreError::Conflict(format!("User '{email}' already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: i64) -> Result<User> {
        self.conn
            .query_row(
                "SELECT id, email, role, created_at FROM users WHERE id = ?1",
                params![id],
                Self::user_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("User not found".to_string()).into())
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, email, role, created_at FROM users WHERE email = ?1",
                params![email.trim()],
                Self::user_from_row,
            )
            .optional()?)
    }

    pub fn get_user_by_token_hash(&self, token_hash: &str) -> Result<Option<User>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, email, role, created_at FROM users WHERE token_hash = ?1",
                params![token_hash],
                Self::user_from_row,
            )
            .optional()?)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, email, role, created_at FROM users ORDER BY email")?;
        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn set_user_role(&self, email: &str, role: UserRole) -> Result<User> {
        let rows = self.conn.execute(
            "UPDATE users SET role = ?1 WHERE email = ?2",
            params![role.as_str(), email.trim()],
        )?;
        if rows == 0 {
            bail!(StoreError::NotFound(format!("User '{email}' not found")));
        }
        self.get_user_by_email(email)?
            .ok_or_else(|| StoreError::NotFound(format!("User '{email}' not found")).into())
    }

    pub fn set_user_token(&self, email: &str, token_hash: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE users SET token_hash = ?1 WHERE email = ?2",
            params![token_hash, email.trim()],
        )?;
        if rows == 0 {
            bail!(StoreError::NotFound(format!("User '{email}' not found")));
        }
        Ok(())
    }

    /// The admin account requests run as when the server has auth disabled.
    pub fn ensure_local_admin(&self) -> Result<User> {
        const LOCAL_ADMIN: &str = "local-admin@localhost";
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO users (email, role, created_at) VALUES (?1, 'admin', ?2)
             ON CONFLICT(email) DO NOTHING",
            params![LOCAL_ADMIN, now],
        )?;
        self.get_user_by_email(LOCAL_ADMIN)?
            .context("Local admin user missing after insert")
    }

    // --- Tag groups ---

    pub fn insert_tag_group(&self, group: &NewTagGroup) -> Result<TagGroup> {
        let now = Local::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT INTO tag_groups (name, display_order, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.name,
                group.display_order,
                group.kind.map(GroupKind::as_str),
                now,
                now
            ],
        );
        match inserted {
            Ok(_) => self.get_tag_group(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => bail!(StoreError::Conflict(format!(
                "Tag group '{}' already exists",
                group.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert the group unless one with the same name exists.
    ///
    /// Returns the stored group and whether this call created it.
    pub fn ensure_tag_group(&self, group: &NewTagGroup) -> Result<(TagGroup, bool)> {
        let now = Local::now().to_rfc3339();
        let created = self.conn.execute(
            "INSERT INTO tag_groups (name, display_order, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO NOTHING",
            params![
                group.name,
                group.display_order,
                group.kind.map(GroupKind::as_str),
                now,
                now
            ],
        )? > 0;
        let stored = self
            .get_tag_group_by_name(&group.name)?
            .with_context(|| format!("Tag group '{}' missing after insert", group.name))?;
        Ok((stored, created))
    }

    pub fn get_tag_group(&self, id: i64) -> Result<TagGroup> {
        self.conn
            .query_row(
                "SELECT id, name, display_order, kind, created_at, updated_at
                 FROM tag_groups WHERE id = ?1",
                params![id],
                Self::tag_group_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("Tag group not found".to_string()).into())
    }

    pub fn get_tag_group_by_name(&self, name: &str) -> Result<Option<TagGroup>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, display_order, kind, created_at, updated_at
                 FROM tag_groups WHERE name = ?1",
                params![name],
                Self::tag_group_from_row,
            )
            .optional()?)
    }

    pub fn list_tag_groups(&self) -> Result<Vec<TagGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, display_order, kind, created_at, updated_at
             FROM tag_groups ORDER BY display_order, name",
        )?;
        let groups = stmt
            .query_map([], Self::tag_group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// All groups in display order, each with its tags sorted by name.
    pub fn list_tag_groups_with_tags(&self) -> Result<Vec<TagGroupWithTags>> {
        let groups = self.list_tag_groups()?;
        let mut by_group: HashMap<i64, Vec<Tag>> = HashMap::new();
        for tag in self.list_tags()? {
            by_group.entry(tag.tag_group_id).or_default().push(tag);
        }
        Ok(groups
            .into_iter()
            .map(|group| {
                let tags = by_group.remove(&group.id).unwrap_or_default();
                TagGroupWithTags { group, tags }
            })
            .collect())
    }

    pub fn update_tag_group(&self, id: i64, update: &UpdateTagGroup) -> Result<TagGroup> {
        self.get_tag_group(id)?;

        let now = Local::now().to_rfc3339();
        if let Some(ref name) = update.name {
            let renamed = self.conn.execute(
                "UPDATE tag_groups SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            );
            match renamed {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    bail!(StoreError::Conflict(format!("Tag group '{name}' already exists")))
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(display_order) = update.display_order {
            self.conn.execute(
                "UPDATE tag_groups SET display_order = ?1, updated_at = ?2 WHERE id = ?3",
                params![display_order, now, id],
            )?;
        }
        if let Some(kind) = update.kind {
            self.conn.execute(
                "UPDATE tag_groups SET kind = ?1, updated_at = ?2 WHERE id = ?3",
                params![kind.map(GroupKind::as_str), now, id],
            )?;
        }

        self.get_tag_group(id)
    }

    /// Deletes the group and, through the cascade, its tags.
    pub fn delete_tag_group(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM tag_groups WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // --- Tags ---

    pub fn insert_tag(&self, tag_group_id: i64, name: &str) -> Result<Tag> {
        let now = Local::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT INTO tags (tag_group_id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![tag_group_id, name, now, now],
        );
        match inserted {
            Ok(_) => self.get_tag(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => bail!(StoreError::Conflict(format!(
                "Tag '{name}' already exists in this group"
            ))),
            Err(e) if is_foreign_key_violation(&e) => {
                bail!(StoreError::NotFound(format!("Tag group {tag_group_id} not found")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert the tag unless the group already has one with this name.
    pub fn ensure_tag(&self, tag_group_id: i64, name: &str) -> Result<(Tag, bool)> {
        let now = Local::now().to_rfc3339();
        let created = self.conn.execute(
            "INSERT INTO tags (tag_group_id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tag_group_id, name) DO NOTHING",
            params![tag_group_id, name, now, now],
        )? > 0;
        let tag = self
            .conn
            .query_row(
                "SELECT id, tag_group_id, name, created_at, updated_at
                 FROM tags WHERE tag_group_id = ?1 AND name = ?2",
                params![tag_group_id, name],
                Self::tag_from_row,
            )
            .with_context(|| format!("Tag '{name}' missing after insert"))?;
        Ok((tag, created))
    }

    pub fn get_tag(&self, id: i64) -> Result<Tag> {
        self.conn
            .query_row(
                "SELECT id, tag_group_id, name, created_at, updated_at FROM tags WHERE id = ?1",
                params![id],
                Self::tag_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("Tag not found".to_string()).into())
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tag_group_id, name, created_at, updated_at FROM tags ORDER BY name, id",
        )?;
        let tags = stmt
            .query_map([], Self::tag_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    /// Renames a tag. Its group never changes.
    pub fn rename_tag(&self, id: i64, name: &str) -> Result<Tag> {
        self.get_tag(id)?;
        let now = Local::now().to_rfc3339();
        let renamed = self.conn.execute(
            "UPDATE tags SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, now, id],
        );
        match renamed {
            Ok(_) => self.get_tag(id),
            Err(e) if is_unique_violation(&e) => bail!(StoreError::Conflict(format!(
                "Tag '{name}' already exists in this group"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_tag(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM tags WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Lowercased tag name -> id. When several groups share a name, the tag
    /// in the earliest group (by display order) wins.
    pub fn tag_name_index(&self) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.name FROM tags t
             JOIN tag_groups g ON t.tag_group_id = g.id
             ORDER BY g.display_order, g.id, t.id",
        )?;
        let mut index = HashMap::new();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (id, name) = row?;
            index.entry(name.to_lowercase()).or_insert(id);
        }
        Ok(index)
    }

    pub(crate) fn tag_names_by_id(&self) -> Result<HashMap<i64, String>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM tags")?;
        let names = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(names)
    }

    // --- Recipes ---

    /// Insert a recipe with its join rows. A taken slug is a `Conflict`.
    pub fn insert_recipe(&self, recipe: &NewRecipe) -> Result<Recipe> {
        self.insert_recipe_if_absent(recipe)?.ok_or_else(|| {
            StoreError::Conflict(format!("Recipe slug '{}' already exists", recipe.slug)).into()
        })
    }

    /// Insert a recipe with its join rows, or return `None` when the slug is taken.
    pub fn insert_recipe_if_absent(&self, recipe: &NewRecipe) -> Result<Option<Recipe>> {
        let now = Local::now().to_rfc3339();
        let created_at = recipe.created_at.clone().unwrap_or_else(|| now.clone());
        let updated_at = recipe.updated_at.clone().unwrap_or(now);
        let structured = serde_json::to_string(&recipe.ingredients_structured)?;

        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO recipes (slug, name, image_url, ingredients_text, instructions, inspiration,
                                  ingredients_structured, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(slug) DO NOTHING",
            params![
                recipe.slug,
                recipe.name,
                recipe.image_url,
                recipe.ingredients_text,
                recipe.instructions,
                recipe.inspiration,
                structured,
                recipe.created_by,
                created_at,
                updated_at,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let id = tx.last_insert_rowid();
        Self::write_recipe_links(&tx, id, &recipe.tag_ids, &recipe.ingredient_tag_ids)?;
        tx.commit()?;

        self.get_recipe(id).map(Some)
    }

    fn write_recipe_links(
        conn: &Connection,
        recipe_id: i64,
        tag_ids: &[i64],
        ingredient_tag_ids: &[i64],
    ) -> Result<()> {
        conn.execute("DELETE FROM recipe_tags WHERE recipe_id = ?1", params![recipe_id])?;
        conn.execute(
            "DELETE FROM recipe_ingredients WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        for (table, ids) in [("recipe_tags", tag_ids), ("recipe_ingredients", ingredient_tag_ids)] {
            let mut stmt = conn.prepare(&format!(
                "INSERT INTO {table} (recipe_id, tag_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING"
            ))?;
            for tag_id in ids {
                stmt.execute(params![recipe_id, tag_id]).map_err(|e| {
                    if is_foreign_key_violation(&e) {
                        anyhow::Error::new(StoreError::Invalid(format!("Tag {tag_id} not found")))
                    } else {
                        e.into()
                    }
                })?;
            }
        }
        Ok(())
    }

    pub fn get_recipe(&self, id: i64) -> Result<Recipe> {
        self.conn
            .query_row(
                &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE id = ?1"),
                params![id],
                Self::recipe_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("Recipe not found".to_string()).into())
    }

    pub fn get_recipe_by_slug(&self, slug: &str) -> Result<Recipe> {
        self.conn
            .query_row(
                &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE slug = ?1"),
                params![slug],
                Self::recipe_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("Recipe '{slug}' not found")).into())
    }

    /// Replace every editable field of a recipe, including its join rows.
    pub fn update_recipe(&self, id: i64, recipe: &NewRecipe) -> Result<Recipe> {
        self.get_recipe(id)?;

        let now = Local::now().to_rfc3339();
        let structured = serde_json::to_string(&recipe.ingredients_structured)?;
        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE recipes SET slug = ?1, name = ?2, image_url = ?3, ingredients_text = ?4,
                    instructions = ?5, inspiration = ?6, ingredients_structured = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                recipe.slug,
                recipe.name,
                recipe.image_url,
                recipe.ingredients_text,
                recipe.instructions,
                recipe.inspiration,
                structured,
                now,
                id,
            ],
        );
        match updated {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => bail!(StoreError::Conflict(format!(
                "Recipe slug '{}' already exists",
                recipe.slug
            ))),
            Err(e) => return Err(e.into()),
        }
        Self::write_recipe_links(&tx, id, &recipe.tag_ids, &recipe.ingredient_tag_ids)?;
        tx.commit()?;

        self.get_recipe(id)
    }

    pub fn delete_recipe(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn set_structured_ingredients(&self, recipe_id: i64, rows: &[IngredientRow]) -> Result<()> {
        let now = Local::now().to_rfc3339();
        let json = serde_json::to_string(rows)?;
        self.conn.execute(
            "UPDATE recipes SET ingredients_structured = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, now, recipe_id],
        )?;
        Ok(())
    }

    fn linked_tags(&self, table: &str, recipe_id: i64) -> Result<Vec<TagRef>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT t.id, t.name FROM {table} rt JOIN tags t ON rt.tag_id = t.id
             WHERE rt.recipe_id = ?1 ORDER BY t.name"
        ))?;
        let tags = stmt
            .query_map(params![recipe_id], |row| {
                Ok(TagRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    pub fn recipe_tags(&self, recipe_id: i64) -> Result<Vec<TagRef>> {
        self.linked_tags("recipe_tags", recipe_id)
    }

    pub fn recipe_ingredient_tags(&self, recipe_id: i64) -> Result<Vec<TagRef>> {
        self.linked_tags("recipe_ingredients", recipe_id)
    }

    fn all_links(&self, table: &str) -> Result<HashMap<i64, Vec<TagRef>>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT rt.recipe_id, t.id, t.name FROM {table} rt JOIN tags t ON rt.tag_id = t.id
             ORDER BY t.name"
        ))?;
        let mut links: HashMap<i64, Vec<TagRef>> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                TagRef {
                    id: row.get(1)?,
                    name: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            let (recipe_id, tag) = row?;
            links.entry(recipe_id).or_default().push(tag);
        }
        Ok(links)
    }

    /// Every recipe, newest first, with its tags and ingredient tags resolved.
    pub fn list_recipe_listings(&self, source: IngredientSource) -> Result<Vec<RecipeListing>> {
        let mut tags = self.all_links("recipe_tags")?;
        let mut joined = match source {
            IngredientSource::JoinTable => self.all_links("recipe_ingredients")?,
            IngredientSource::Structured => HashMap::new(),
        };
        let names = match source {
            IngredientSource::Structured => self.tag_names_by_id()?,
            IngredientSource::JoinTable => HashMap::new(),
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECIPE_COLUMNS} FROM recipes ORDER BY created_at DESC, id DESC"
        ))?;
        let recipes = stmt
            .query_map([], Self::recipe_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recipes
            .into_iter()
            .map(|r| {
                let ingredient_tags = match source {
                    IngredientSource::JoinTable => joined.remove(&r.id).unwrap_or_default(),
                    IngredientSource::Structured => {
                        structured_tag_refs(&r.ingredients_structured, &names)
                    }
                };
                RecipeListing {
                    tags: tags.remove(&r.id).unwrap_or_default(),
                    ingredient_tags,
                    id: r.id,
                    slug: r.slug,
                    name: r.name,
                    image_url: r.image_url,
                    created_at: r.created_at,
                }
            })
            .collect())
    }

    /// Fill empty structured ingredient lists from the join table.
    ///
    /// Recipes that already carry structured rows are never touched.
    pub fn backfill_structured_ingredients(&self) -> Result<BackfillSummary> {
        let joined = self.all_links("recipe_ingredients")?;
        let mut summary = BackfillSummary::default();

        let mut recipe_ids: Vec<i64> = joined.keys().copied().collect();
        recipe_ids.sort_unstable();
        for recipe_id in recipe_ids {
            summary.processed += 1;
            let recipe = self.get_recipe(recipe_id)?;
            if !recipe.ingredients_structured.is_empty() {
                summary.skipped += 1;
                continue;
            }
            let rows: Vec<IngredientRow> = joined[&recipe_id]
                .iter()
                .map(|t| IngredientRow::for_tag(t.id))
                .collect();
            self.set_structured_ingredients(recipe_id, &rows)?;
            tracing::info!(recipe = %recipe.slug, rows = rows.len(), "backfilled structured ingredients");
            summary.updated += 1;
        }
        Ok(summary)
    }

    // --- Favorites ---

    /// Returns true when the favorite was newly added.
    pub fn add_favorite(&self, user_id: i64, recipe_id: i64) -> Result<bool> {
        self.get_recipe(recipe_id)?;
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            "INSERT INTO user_favorites (user_id, recipe_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, recipe_id) DO NOTHING",
            params![user_id, recipe_id, now],
        )?;
        Ok(rows > 0)
    }

    pub fn remove_favorite(&self, user_id: i64, recipe_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM user_favorites WHERE user_id = ?1 AND recipe_id = ?2",
            params![user_id, recipe_id],
        )?;
        Ok(rows > 0)
    }

    pub fn is_favorite(&self, user_id: i64, recipe_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM user_favorites WHERE user_id = ?1 AND recipe_id = ?2",
                params![user_id, recipe_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Favorite recipe ids, most recently favorited first.
    pub fn favorite_recipe_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT recipe_id FROM user_favorites WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // --- Calendar ---

    /// Schedule a recipe into a slot, replacing whatever the slot held.
    pub fn upsert_calendar_entry(&self, entry: &NewCalendarEntry) -> Result<CalendarEntry> {
        self.get_recipe(entry.recipe_id)?;
        let now = Local::now().to_rfc3339();
        let date = entry.date.format("%Y-%m-%d").to_string();
        self.conn.execute(
            "INSERT INTO calendar_entries (user_id, recipe_id, date, meal_type, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, date, meal_type) DO UPDATE SET
                 recipe_id = excluded.recipe_id,
                 notes = excluded.notes,
                 updated_at = excluded.updated_at",
            params![
                entry.user_id,
                entry.recipe_id,
                date,
                entry.meal_type.as_str(),
                entry.notes,
                now,
                now,
            ],
        )?;
        self.conn
            .query_row(
                &format!(
                    "{CALENDAR_SELECT} WHERE ce.user_id = ?1 AND ce.date = ?2 AND ce.meal_type = ?3"
                ),
                params![entry.user_id, date, entry.meal_type.as_str()],
                Self::calendar_entry_from_row,
            )
            .context("Calendar entry missing after upsert")
    }

    /// Entries for `start..=end`, ordered by date then breakfast, lunch, dinner.
    pub fn calendar_entries_between(
        &self,
        user_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CalendarEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CALENDAR_SELECT}
             WHERE ce.user_id = ?1 AND ce.date BETWEEN ?2 AND ?3
             ORDER BY ce.date,
                 CASE ce.meal_type WHEN 'breakfast' THEN 0 WHEN 'lunch' THEN 1 ELSE 2 END"
        ))?;
        let entries = stmt
            .query_map(
                params![
                    user_id,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string()
                ],
                Self::calendar_entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_calendar_entry(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM calendar_entries WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }
}

const RECIPE_COLUMNS: &str = "id, slug, name, image_url, ingredients_text, instructions, inspiration, \
     ingredients_structured, created_by, created_at, updated_at";

const CALENDAR_SELECT: &str = "SELECT ce.id, ce.user_id, ce.recipe_id, ce.date, ce.meal_type, ce.notes, \
     ce.created_at, ce.updated_at, r.name, r.slug \
     FROM calendar_entries ce JOIN recipes r ON ce.recipe_id = r.id";

fn parse_structured(raw: &str) -> Vec<IngredientRow> {
    match serde_json::from_str(raw) {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed structured ingredients");
            Vec::new()
        }
    }
}

/// Distinct tag refs named by structured rows, in row order. Rows without a
/// tag, or pointing at a deleted tag, are dropped.
fn structured_tag_refs(rows: &[IngredientRow], names: &HashMap<i64, String>) -> Vec<TagRef> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| row.tag_id)
        .filter(|id| seen.insert(*id))
        .filter_map(|id| {
            names.get(&id).map(|name| TagRef {
                id,
                name: name.clone(),
            })
        })
        .collect()
}

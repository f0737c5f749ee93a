//! Import of a Framer CMS export: five CSV files whose rows reference each
//! other by `Slug`.
//!
//! Tag categories and ingredient categories both become tag groups (with an
//! explicit kind), tags and ingredients both become tags, and recipes link to
//! them by slug. Like the plain CSV importer, every stage is idempotent and
//! bad rows are logged and skipped.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::db::Database;
use crate::document::html_to_document;
use crate::import::{CsvRows, StageSummary, non_empty, split_names};
use crate::models::{GroupKind, IngredientRow, NewRecipe, NewTagGroup, validate_recipe_fields};

/// File names Framer gives each collection export.
pub const TAG_CATEGORIES_FILE: &str = "Tag Categories.csv";
pub const INGREDIENT_CATEGORIES_FILE: &str = "Ingredient Categories.csv";
pub const TAGS_FILE: &str = "Tags.csv";
pub const INGREDIENTS_FILE: &str = "Ingredients.csv";
pub const RECIPES_FILE: &str = "Recipes.csv";

#[derive(Debug, Clone)]
pub struct FramerCategory {
    pub slug: String,
    pub title: String,
}

/// A tag or an ingredient; `category` is the slug of its category.
#[derive(Debug, Clone)]
pub struct FramerTag {
    pub slug: String,
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, Default)]
pub struct FramerRecipe {
    pub slug: String,
    pub title: String,
    pub image: Option<String>,
    pub tags: Vec<String>,
    pub ingredients: Vec<String>,
    pub ingredients_text: String,
    pub instructions_text: String,
    pub inspiration: String,
}

/// Raw contents of the five export files.
#[derive(Debug, Clone, Default)]
pub struct FramerSources {
    pub tag_categories: String,
    pub ingredient_categories: String,
    pub tags: String,
    pub ingredients: String,
    pub recipes: String,
}

impl FramerSources {
    /// Read the five export files from `dir`. Every file must exist.
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read file: {}", path.display()))
        };
        Ok(Self {
            tag_categories: read(TAG_CATEGORIES_FILE)?,
            ingredient_categories: read(INGREDIENT_CATEGORIES_FILE)?,
            tags: read(TAGS_FILE)?,
            ingredients: read(INGREDIENTS_FILE)?,
            recipes: read(RECIPES_FILE)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FramerImportSummary {
    pub tag_categories: StageSummary,
    pub ingredient_categories: StageSummary,
    pub tags: StageSummary,
    pub ingredients: StageSummary,
    pub recipes: StageSummary,
}

// --- Parsing ---

/// Parse `Slug,Title`. A missing title falls back to the slug.
pub fn parse_categories_csv<R: Read>(reader: R) -> Result<Vec<FramerCategory>> {
    let rows = CsvRows::read(reader, &["slug"])?;
    Ok(rows
        .records
        .iter()
        .map(|r| {
            let slug = rows.field(r, "slug").to_string();
            let title = non_empty(rows.field(r, "title")).unwrap_or_else(|| slug.clone());
            FramerCategory { slug, title }
        })
        .collect())
}

/// Parse tag or ingredient rows. `name_column` is `title` for tags and `name`
/// for ingredients; `category_column` is `tag category` or `category`.
fn parse_tag_rows<R: Read>(
    reader: R,
    name_column: &str,
    category_column: &str,
) -> Result<Vec<FramerTag>> {
    let rows = CsvRows::read(reader, &["slug", category_column])?;
    Ok(rows
        .records
        .iter()
        .map(|r| {
            let slug = rows.field(r, "slug").to_string();
            let name = non_empty(rows.field(r, name_column)).unwrap_or_else(|| slug.clone());
            FramerTag {
                slug,
                name,
                category: rows.field(r, category_column).to_string(),
            }
        })
        .collect())
}

/// Parse `Slug,Title,Tag Category`.
pub fn parse_tags_csv<R: Read>(reader: R) -> Result<Vec<FramerTag>> {
    parse_tag_rows(reader, "title", "tag category")
}

/// Parse `Slug,Name,Category`.
pub fn parse_ingredients_csv<R: Read>(reader: R) -> Result<Vec<FramerTag>> {
    parse_tag_rows(reader, "name", "category")
}

/// Parse `Slug,Title,Image,Tags,Ingredients,Ingredients Text,Instructions Text,Inspiration`.
/// `Tags` and `Ingredients` hold comma-separated slugs.
pub fn parse_recipes_csv<R: Read>(reader: R) -> Result<Vec<FramerRecipe>> {
    let rows = CsvRows::read(reader, &["slug", "title"])?;
    Ok(rows
        .records
        .iter()
        .map(|r| FramerRecipe {
            slug: rows.field(r, "slug").to_string(),
            title: rows.field(r, "title").to_string(),
            image: non_empty(rows.field(r, "image")),
            tags: split_names(rows.field(r, "tags")),
            ingredients: split_names(rows.field(r, "ingredients")),
            ingredients_text: rows.field(r, "ingredients text").to_string(),
            instructions_text: rows.field(r, "instructions text").to_string(),
            inspiration: rows.field(r, "inspiration").to_string(),
        })
        .collect())
}

// --- Stages ---

/// Create missing groups for one category file. `order` continues across
/// files so tag categories sort before ingredient categories.
fn import_categories(
    db: &Database,
    records: &[FramerCategory],
    kind: GroupKind,
    order: &mut i64,
) -> (StageSummary, HashMap<String, i64>) {
    let mut summary = StageSummary::default();
    let mut groups = HashMap::new();

    for record in records {
        if record.slug.is_empty() {
            tracing::warn!(category = %record.title, "skipping category without a slug");
            summary.skipped += 1;
            continue;
        }
        let new = NewTagGroup {
            name: record.title.clone(),
            display_order: *order,
            kind: Some(kind),
        };
        *order += 1;
        match db.ensure_tag_group(&new) {
            Ok((group, created)) => {
                if created {
                    summary.created += 1;
                } else {
                    summary.existing += 1;
                }
                groups.insert(record.slug.clone(), group.id);
            }
            Err(e) => {
                tracing::warn!(category = %record.title, error = %e, "failed to import category");
                summary.failed += 1;
            }
        }
    }
    (summary, groups)
}

/// Create missing tags, resolving categories by slug. Returns slug -> tag id.
fn import_tags(
    db: &Database,
    records: &[FramerTag],
    categories: &HashMap<String, i64>,
) -> (StageSummary, HashMap<String, i64>) {
    let mut summary = StageSummary::default();
    let mut tags = HashMap::new();

    for record in records {
        if record.slug.is_empty() || record.category.is_empty() {
            tracing::warn!(tag = %record.name, "skipping tag without a slug or category");
            summary.skipped += 1;
            continue;
        }
        let Some(group_id) = categories.get(&record.category).copied() else {
            tracing::warn!(tag = %record.name, category = %record.category, "category not found");
            summary.skipped += 1;
            continue;
        };
        match db.ensure_tag(group_id, &record.name) {
            Ok((tag, created)) => {
                if created {
                    summary.created += 1;
                } else {
                    summary.existing += 1;
                }
                tags.insert(record.slug.clone(), tag.id);
            }
            Err(e) => {
                tracing::warn!(tag = %record.name, error = %e, "failed to import tag");
                summary.failed += 1;
            }
        }
    }
    (summary, tags)
}

fn resolve_slugs(slugs: &[String], index: &HashMap<String, i64>, recipe: &str) -> Vec<i64> {
    let mut ids = Vec::with_capacity(slugs.len());
    for slug in slugs {
        match index.get(slug) {
            Some(id) if !ids.contains(id) => ids.push(*id),
            Some(_) => {}
            None => tracing::warn!(recipe, tag = %slug, "unknown slug, dropped"),
        }
    }
    ids
}

fn import_recipes(
    db: &Database,
    records: &[FramerRecipe],
    tags: &HashMap<String, i64>,
    ingredients: &HashMap<String, i64>,
) -> StageSummary {
    let mut summary = StageSummary::default();

    for record in records {
        if let Err(e) = validate_recipe_fields(&record.title, &record.slug) {
            tracing::warn!(recipe = %record.slug, error = %e, "skipping recipe");
            summary.skipped += 1;
            continue;
        }

        let ingredient_tag_ids = resolve_slugs(&record.ingredients, ingredients, &record.slug);
        let recipe = NewRecipe {
            slug: record.slug.clone(),
            name: record.title.clone(),
            image_url: record.image.clone(),
            ingredients_text: html_to_document(&record.ingredients_text),
            instructions: html_to_document(&record.instructions_text),
            inspiration: html_to_document(&record.inspiration),
            ingredients_structured: ingredient_tag_ids
                .iter()
                .map(|id| IngredientRow::for_tag(*id))
                .collect(),
            tag_ids: resolve_slugs(&record.tags, tags, &record.slug),
            ingredient_tag_ids,
            ..NewRecipe::default()
        };

        match db.insert_recipe_if_absent(&recipe) {
            Ok(Some(_)) => summary.created += 1,
            Ok(None) => {
                tracing::debug!(recipe = %record.slug, "slug exists, skipped");
                summary.existing += 1;
            }
            Err(e) => {
                tracing::warn!(recipe = %record.slug, error = %e, "failed to import recipe");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Run all five stages in foreign-key order.
///
/// Every file is parsed before anything is written, so a malformed file
/// leaves the store untouched.
pub fn import_framer(db: &Database, sources: &FramerSources) -> Result<FramerImportSummary> {
    let tag_categories =
        parse_categories_csv(sources.tag_categories.as_bytes()).context("Tag Categories CSV")?;
    let ingredient_categories = parse_categories_csv(sources.ingredient_categories.as_bytes())
        .context("Ingredient Categories CSV")?;
    let tag_records = parse_tags_csv(sources.tags.as_bytes()).context("Tags CSV")?;
    let ingredient_records =
        parse_ingredients_csv(sources.ingredients.as_bytes()).context("Ingredients CSV")?;
    let recipe_records = parse_recipes_csv(sources.recipes.as_bytes()).context("Recipes CSV")?;

    let mut order = 0;
    let (tag_categories, tag_groups) =
        import_categories(db, &tag_categories, GroupKind::Recipe, &mut order);
    let (ingredient_categories, ingredient_groups) =
        import_categories(db, &ingredient_categories, GroupKind::Ingredient, &mut order);
    let (tags, tag_ids) = import_tags(db, &tag_records, &tag_groups);
    let (ingredients, ingredient_ids) = import_tags(db, &ingredient_records, &ingredient_groups);
    let recipes = import_recipes(db, &recipe_records, &tag_ids, &ingredient_ids);

    let summary = FramerImportSummary {
        tag_categories,
        ingredient_categories,
        tags,
        ingredients,
        recipes,
    };
    tracing::info!(?summary, "Framer import finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sources() -> FramerSources {
        FramerSources {
            tag_categories: "\u{feff}Slug,Title\ncuisine,Cuisine\ncourse,\n".to_string(),
            ingredient_categories: "Slug,Title\nprotein,Protein\n".to_string(),
            tags: "Slug,Title,Tag Category\nthai,Thai,cuisine\nmain,Main,course\nlost,Lost,nowhere\n"
                .to_string(),
            ingredients: "Slug,Name,Category\nchicken,Chicken,protein\ntofu,Tofu,protein\nsalt,Salt,\n"
                .to_string(),
            recipes: "Slug,Title,Image,Tags,Ingredients,Ingredients Text,Instructions Text\n\
                pad-thai,Pad Thai,https://img/pad.jpg,\"thai, main, ghost\",\"chicken,tofu\",\
                \"<ul><li>Noodles</li></ul>\",<p>Fry</p>\n\
                ,Nameless,,,,,\n"
                .to_string(),
        }
    }

    #[test]
    fn test_parse_categories_title_falls_back_to_slug() {
        let records = parse_categories_csv("Slug,Title\ncourse,\n".as_bytes()).unwrap();
        assert_eq!(records[0].title, "course");
    }

    #[test]
    fn test_parse_tags_requires_category_column() {
        let err = parse_tags_csv("Slug,Title\nthai,Thai\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("tag category"));
    }

    #[test]
    fn test_import_framer_all_stages() {
        let db = Database::open_in_memory().unwrap();
        let summary = import_framer(&db, &sources()).unwrap();

        assert_eq!(summary.tag_categories.created, 2);
        assert_eq!(summary.ingredient_categories.created, 1);
        assert_eq!(summary.tags, StageSummary { created: 2, skipped: 1, ..StageSummary::default() });
        assert_eq!(
            summary.ingredients,
            StageSummary { created: 2, skipped: 1, ..StageSummary::default() }
        );
        assert_eq!(summary.recipes, StageSummary { created: 1, skipped: 1, ..StageSummary::default() });

        let protein = db.get_tag_group_by_name("Protein").unwrap().unwrap();
        assert_eq!(protein.kind, Some(GroupKind::Ingredient));
        assert_eq!(protein.display_order, 2);
        assert!(db.get_tag_group_by_name("course").unwrap().is_some());

        let recipe = db.get_recipe_by_slug("pad-thai").unwrap();
        assert_eq!(recipe.image_url.as_deref(), Some("https://img/pad.jpg"));
        let tags: HashSet<String> = db.recipe_tags(recipe.id).unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(tags, HashSet::from(["Thai".to_string(), "Main".to_string()]));
        let ingredients: Vec<String> = db
            .recipe_ingredient_tags(recipe.id)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(ingredients.len(), 2);
        assert_eq!(recipe.ingredients_structured.len(), 2);
        assert_eq!(
            crate::document::render_html(&recipe.instructions),
            "<p>Fry</p>"
        );
    }

    #[test]
    fn test_import_framer_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        import_framer(&db, &sources()).unwrap();
        let again = import_framer(&db, &sources()).unwrap();

        assert_eq!(again.tag_categories.existing, 2);
        assert_eq!(again.ingredient_categories.existing, 1);
        assert_eq!(again.tags.existing, 2);
        assert_eq!(again.ingredients.existing, 2);
        assert_eq!(again.recipes.existing, 1);
        assert_eq!(again.recipes.created, 0);
    }

    #[test]
    fn test_malformed_file_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let mut bad = sources();
        bad.recipes = "Name\nPad Thai\n".to_string();
        let err = import_framer(&db, &bad).unwrap_err();
        assert!(format!("{err:#}").contains("Recipes CSV"));
        assert!(db.list_tag_groups().unwrap().is_empty());
    }

    #[test]
    fn test_read_dir_requires_every_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TAG_CATEGORIES_FILE), "Slug,Title\n").unwrap();
        let err = FramerSources::read_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains(INGREDIENT_CATEGORIES_FILE));
    }
}

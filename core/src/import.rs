//! Bulk CSV import of tag groups, tags and recipes.
//!
//! Stages run in foreign-key order (groups, then tags, then recipes) and each
//! one is idempotent: records whose natural key already exists are counted and
//! left alone. A bad record is logged and skipped; only an unreadable file
//! (for example a missing header column) fails the whole stage.

use std::collections::HashMap;
use std::io::Read;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::db::Database;
use crate::document::plain_text_to_document;
use crate::models::{IngredientRow, NewRecipe, NewTagGroup, slugify, validate_recipe_fields};

#[derive(Debug, Clone)]
pub struct TagGroupRecord {
    pub name: String,
    pub display_order: i64,
}

#[derive(Debug, Clone)]
pub struct TagRecord {
    pub name: String,
    pub tag_group: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecipeRecord {
    pub name: String,
    pub slug: Option<String>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
    pub ingredients: Vec<String>,
    pub ingredients_text: String,
    pub instructions: String,
    pub inspiration: String,
}

/// Per-stage outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub created: usize,
    pub existing: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CsvImportSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_groups: Option<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipes: Option<StageSummary>,
}

/// CSV contents for each stage. Stages without input are not run.
#[derive(Debug, Clone, Default)]
pub struct CsvSources {
    pub tag_groups: Option<String>,
    pub tags: Option<String>,
    pub recipes: Option<String>,
}

// --- Parsing ---

/// Rows keyed by lowercased header name.
pub(crate) struct CsvRows {
    headers: Vec<String>,
    pub(crate) records: Vec<csv::StringRecord>,
}

impl CsvRows {
    pub(crate) fn read<R: Read>(reader: R, required: &[&str]) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .context("Failed to read CSV headers")?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();

        for name in required {
            if !headers.iter().any(|h| h == name) {
                bail!("Missing required column: {name}");
            }
        }

        let mut records = Vec::new();
        for (line_num, result) in rdr.records().enumerate() {
            let record =
                result.with_context(|| format!("Failed to parse CSV row {}", line_num + 2))?;
            if record.iter().all(str::is_empty) {
                continue; // blank line
            }
            records.push(record);
        }
        Ok(Self { headers, records })
    }

    pub(crate) fn field<'r>(&self, record: &'r csv::StringRecord, name: &str) -> &'r str {
        self.headers
            .iter()
            .position(|h| h == name)
            .and_then(|i| record.get(i))
            .unwrap_or("")
    }
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

pub(crate) fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `name,display_order`. A missing or unparseable order is 0.
pub fn parse_tag_groups_csv<R: Read>(reader: R) -> Result<Vec<TagGroupRecord>> {
    let rows = CsvRows::read(reader, &["name"])?;
    Ok(rows
        .records
        .iter()
        .map(|r| TagGroupRecord {
            name: rows.field(r, "name").to_string(),
            display_order: rows.field(r, "display_order").parse().unwrap_or(0),
        })
        .collect())
}

/// Parse `name,tag_group`.
pub fn parse_tags_csv<R: Read>(reader: R) -> Result<Vec<TagRecord>> {
    let rows = CsvRows::read(reader, &["name", "tag_group"])?;
    Ok(rows
        .records
        .iter()
        .map(|r| TagRecord {
            name: rows.field(r, "name").to_string(),
            tag_group: rows.field(r, "tag_group").to_string(),
        })
        .collect())
}

/// Parse `name,slug,image_url,tags,ingredients,ingredients_text,instructions,inspiration`.
/// Only `name` is required as a column.
pub fn parse_recipes_csv<R: Read>(reader: R) -> Result<Vec<RecipeRecord>> {
    let rows = CsvRows::read(reader, &["name"])?;
    Ok(rows
        .records
        .iter()
        .map(|r| RecipeRecord {
            name: rows.field(r, "name").to_string(),
            slug: non_empty(rows.field(r, "slug")),
            image_url: non_empty(rows.field(r, "image_url")),
            tags: split_names(rows.field(r, "tags")),
            ingredients: split_names(rows.field(r, "ingredients")),
            ingredients_text: rows.field(r, "ingredients_text").to_string(),
            instructions: rows.field(r, "instructions").to_string(),
            inspiration: rows.field(r, "inspiration").to_string(),
        })
        .collect())
}

// --- Stages ---

/// Create missing tag groups. Returns group name -> id for the tags stage.
pub fn import_tag_groups(
    db: &Database,
    records: &[TagGroupRecord],
) -> (StageSummary, HashMap<String, i64>) {
    let mut summary = StageSummary::default();
    let mut groups = HashMap::new();

    for record in records {
        if record.name.is_empty() {
            tracing::warn!("skipping tag group without a name");
            summary.skipped += 1;
            continue;
        }
        let new = NewTagGroup {
            name: record.name.clone(),
            display_order: record.display_order,
            kind: None,
        };
        match db.ensure_tag_group(&new) {
            Ok((group, created)) => {
                if created {
                    summary.created += 1;
                } else {
                    summary.existing += 1;
                }
                groups.insert(group.name, group.id);
            }
            Err(e) => {
                tracing::warn!(group = %record.name, error = %e, "failed to import tag group");
                summary.failed += 1;
            }
        }
    }
    (summary, groups)
}

/// Create missing tags. Groups are resolved through `groups`, then the store.
///
/// Returns lowercased tag name -> id for the recipes stage.
pub fn import_tags(
    db: &Database,
    records: &[TagRecord],
    groups: &HashMap<String, i64>,
) -> (StageSummary, HashMap<String, i64>) {
    let mut summary = StageSummary::default();
    let mut tags = HashMap::new();

    for record in records {
        if record.name.is_empty() || record.tag_group.is_empty() {
            tracing::warn!(tag = %record.name, "skipping tag without a name or group");
            summary.skipped += 1;
            continue;
        }
        let group_id = match groups.get(&record.tag_group) {
            Some(id) => Some(*id),
            None => db
                .get_tag_group_by_name(&record.tag_group)
                .ok()
                .flatten()
                .map(|g| g.id),
        };
        let Some(group_id) = group_id else {
            tracing::warn!(tag = %record.name, group = %record.tag_group, "tag group not found");
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
                tags.insert(tag.name.to_lowercase(), tag.id);
            }
            Err(e) => {
                tracing::warn!(tag = %record.name, error = %e, "failed to import tag");
                summary.failed += 1;
            }
        }
    }
    (summary, tags)
}

/// Resolve names through the index, dropping (and logging) unknown ones.
/// Repeated names collapse to one id.
pub(crate) fn resolve_tag_names(
    names: &[String],
    index: &HashMap<String, i64>,
    recipe: &str,
) -> Vec<i64> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        match index.get(&name.to_lowercase()) {
            Some(id) if !ids.contains(id) => ids.push(*id),
            Some(_) => {}
            None => tracing::warn!(recipe, tag = %name, "unknown tag, dropped"),
        }
    }
    ids
}

/// Create recipes whose slug is not taken yet.
///
/// Tag names resolve through the store's tags, overlaid with `tags` from the
/// tags stage of the same run.
pub fn import_recipes(
    db: &Database,
    records: &[RecipeRecord],
    tags: &HashMap<String, i64>,
) -> Result<StageSummary> {
    let mut index = db.tag_name_index()?;
    index.extend(tags.iter().map(|(name, id)| (name.clone(), *id)));

    let mut summary = StageSummary::default();
    for record in records {
        let slug = record
            .slug
            .clone()
            .unwrap_or_else(|| slugify(&record.name));
        if let Err(e) = validate_recipe_fields(&record.name, &slug) {
            tracing::warn!(recipe = %record.name, error = %e, "skipping recipe");
            summary.skipped += 1;
            continue;
        }

        let tag_ids = resolve_tag_names(&record.tags, &index, &slug);
        let ingredient_tag_ids = resolve_tag_names(&record.ingredients, &index, &slug);
        let recipe = NewRecipe {
            slug: slug.clone(),
            name: record.name.clone(),
            image_url: record.image_url.clone(),
            ingredients_text: plain_text_to_document(&record.ingredients_text),
            instructions: plain_text_to_document(&record.instructions),
            inspiration: plain_text_to_document(&record.inspiration),
            ingredients_structured: ingredient_tag_ids
                .iter()
                .map(|id| IngredientRow::for_tag(*id))
                .collect(),
            tag_ids,
            ingredient_tag_ids,
            ..NewRecipe::default()
        };

        match db.insert_recipe_if_absent(&recipe) {
            Ok(Some(_)) => summary.created += 1,
            Ok(None) => {
                tracing::debug!(recipe = %slug, "slug exists, skipped");
                summary.existing += 1;
            }
            Err(e) => {
                tracing::warn!(recipe = %slug, error = %e, "failed to import recipe");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Run every stage that has input, in foreign-key order.
pub fn import_csv(db: &Database, sources: &CsvSources) -> Result<CsvImportSummary> {
    let mut summary = CsvImportSummary::default();

    let mut groups = HashMap::new();
    if let Some(csv) = &sources.tag_groups {
        let records = parse_tag_groups_csv(csv.as_bytes()).context("Tag groups CSV")?;
        let (stage, map) = import_tag_groups(db, &records);
        tracing::info!(?stage, "imported tag groups");
        summary.tag_groups = Some(stage);
        groups = map;
    }

    let mut tags = HashMap::new();
    if let Some(csv) = &sources.tags {
        let records = parse_tags_csv(csv.as_bytes()).context("Tags CSV")?;
        let (stage, map) = import_tags(db, &records, &groups);
        tracing::info!(?stage, "imported tags");
        summary.tags = Some(stage);
        tags = map;
    }

    if let Some(csv) = &sources.recipes {
        let records = parse_recipes_csv(csv.as_bytes()).context("Recipes CSV")?;
        let stage = import_recipes(db, &records, &tags)?;
        tracing::info!(?stage, "imported recipes");
        summary.recipes = Some(stage);
    }

    Ok(summary)
}

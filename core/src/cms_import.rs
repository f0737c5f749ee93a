//! Import of a headless-CMS JSON export: `{recipes, tags, tagGroups}`.
//!
//! Records reference each other by CMS id when present, otherwise by name.
//! Rich-text fields arrive as HTML and are converted to documents.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::document::html_to_document;
use crate::import::{StageSummary, resolve_tag_names};
use crate::models::{IngredientRow, NewRecipe, NewTagGroup, slugify, validate_recipe_fields};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsExport {
    pub recipes: Vec<CmsRecipe>,
    pub tags: Vec<CmsTag>,
    pub tag_groups: Vec<CmsTagGroup>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsTagGroup {
    pub id: Option<String>,
    pub name: String,
    pub display_order: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsTag {
    pub id: Option<String>,
    pub name: String,
    pub tag_group: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsRecipe {
    pub id: Option<String>,
    pub name: String,
    pub slug: Option<String>,
    pub image: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ingredients: Vec<String>,
    pub ingredients_text: Option<String>,
    pub instructions: Option<String>,
    pub inspiration: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CmsImportSummary {
    pub tag_groups: StageSummary,
    pub tags: StageSummary,
    pub recipes: StageSummary,
}

fn cms_key(id: Option<&String>, name: &str) -> String {
    id.filter(|id| !id.is_empty())
        .map_or_else(|| name.to_string(), String::clone)
}

fn tally(summary: &mut StageSummary, created: bool) {
    if created {
        summary.created += 1;
    } else {
        summary.existing += 1;
    }
}

pub fn import_cms(db: &Database, export: &CmsExport) -> Result<CmsImportSummary> {
    let mut summary = CmsImportSummary::default();

    let mut groups: HashMap<String, i64> = HashMap::new();
    for group in &export.tag_groups {
        let name = group.name.trim();
        if name.is_empty() {
            summary.tag_groups.skipped += 1;
            continue;
        }
        let new = NewTagGroup {
            name: name.to_string(),
            display_order: group.display_order.unwrap_or(0),
            kind: None,
        };
        match db.ensure_tag_group(&new) {
            Ok((stored, created)) => {
                tally(&mut summary.tag_groups, created);
                groups.insert(cms_key(group.id.as_ref(), name), stored.id);
            }
            Err(e) => {
                tracing::warn!(group = name, error = %e, "failed to import tag group");
                summary.tag_groups.failed += 1;
            }
        }
    }

    // Keys are CMS ids or names as written; recipes fall back to stored names.
    let mut tags: HashMap<String, i64> = HashMap::new();
    for tag in &export.tags {
        let name = tag.name.trim();
        let Some(group_id) = groups.get(&tag.tag_group).copied() else {
            tracing::warn!(tag = name, group = %tag.tag_group, "tag group not found");
            summary.tags.skipped += 1;
            continue;
        };
        if name.is_empty() {
            summary.tags.skipped += 1;
            continue;
        }
        match db.ensure_tag(group_id, name) {
            Ok((stored, created)) => {
                tally(&mut summary.tags, created);
                tags.insert(cms_key(tag.id.as_ref(), name), stored.id);
            }
            Err(e) => {
                tracing::warn!(tag = name, error = %e, "failed to import tag");
                summary.tags.failed += 1;
            }
        }
    }

    let stored_names = db.tag_name_index()?;
    for recipe in &export.recipes {
        let slug = recipe
            .slug
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&recipe.name));
        if let Err(e) = validate_recipe_fields(&recipe.name, &slug) {
            tracing::warn!(recipe = %recipe.name, error = %e, "skipping recipe");
            summary.recipes.skipped += 1;
            continue;
        }

        let resolve = |keys: &[String]| -> Vec<i64> {
            let mut ids = Vec::new();
            let mut unmatched = Vec::new();
            for key in keys {
                match tags.get(key) {
                    Some(id) if !ids.contains(id) => ids.push(*id),
                    Some(_) => {}
                    None => unmatched.push(key.clone()),
                }
            }
            for id in resolve_tag_names(&unmatched, &stored_names, &slug) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ids
        };
        let tag_ids = resolve(&recipe.tags);
        let ingredient_tag_ids = resolve(&recipe.ingredients);

        let rich = |field: &Option<String>| html_to_document(field.as_deref().unwrap_or_default());
        let new = NewRecipe {
            slug: slug.clone(),
            name: recipe.name.trim().to_string(),
            image_url: recipe.image.clone().or_else(|| recipe.image_url.clone()),
            ingredients_text: rich(&recipe.ingredients_text),
            instructions: rich(&recipe.instructions),
            inspiration: rich(&recipe.inspiration),
            ingredients_structured: ingredient_tag_ids
                .iter()
                .map(|id| IngredientRow::for_tag(*id))
                .collect(),
            tag_ids,
            ingredient_tag_ids,
            created_by: None,
            created_at: recipe.created_at.clone(),
            updated_at: recipe.updated_at.clone(),
        };

        match db.insert_recipe_if_absent(&new) {
            Ok(Some(_)) => summary.recipes.created += 1,
            Ok(None) => summary.recipes.existing += 1,
            Err(e) => {
                tracing::warn!(recipe = %slug, error = %e, "failed to import recipe");
                summary.recipes.failed += 1;
            }
        }
    }

    tracing::info!(
        groups = summary.tag_groups.created,
        tags = summary.tags.created,
        recipes = summary.recipes.created,
        "CMS import finished"
    );
    Ok(summary)
}

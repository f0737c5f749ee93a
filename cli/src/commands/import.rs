use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use potluck_core::cms_import::{CmsExport, import_cms};
use potluck_core::db::Database;
use potluck_core::framer_import::{FramerSources, import_framer};
use potluck_core::import::{CsvSources, import_csv};

use super::helpers::print_stage;

/// CSV files for each import stage. Missing stages are skipped.
pub(crate) struct CsvFiles {
    pub tag_groups: Option<PathBuf>,
    pub tags: Option<PathBuf>,
    pub recipes: Option<PathBuf>,
}

fn read_source(path: Option<&PathBuf>) -> Result<Option<String>> {
    path.map(|p| {
        std::fs::read_to_string(p).with_context(|| format!("Failed to read file: {}", p.display()))
    })
    .transpose()
}

pub(crate) fn cmd_import_csv(db: &Database, files: &CsvFiles, json: bool) -> Result<()> {
    if files.tag_groups.is_none() && files.tags.is_none() && files.recipes.is_none() {
        bail!("No CSV files given. Pass tag groups, tags and recipes files or use --tag-groups/--tags/--recipes");
    }

    let sources = CsvSources {
        tag_groups: read_source(files.tag_groups.as_ref())?,
        tags: read_source(files.tags.as_ref())?,
        recipes: read_source(files.recipes.as_ref())?,
    };

    let summary = import_csv(db, &sources)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Import complete.\n");
        if let Some(stage) = &summary.tag_groups {
            print_stage("Tag groups:", stage);
        }
        if let Some(stage) = &summary.tags {
            print_stage("Tags:", stage);
        }
        if let Some(stage) = &summary.recipes {
            print_stage("Recipes:", stage);
        }
    }
    Ok(())
}

pub(crate) fn cmd_import_cms(db: &Database, path: &Path, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let export: CmsExport = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid CMS export: {}", path.display()))?;

    let summary = import_cms(db, &export)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Import complete.\n");
        print_stage("Tag groups:", &summary.tag_groups);
        print_stage("Tags:", &summary.tags);
        print_stage("Recipes:", &summary.recipes);
    }
    Ok(())
}

/// Import the five CSV files of a Framer CMS export found in `dir`.
pub(crate) fn cmd_import_framer(db: &Database, dir: &Path, json: bool) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let sources = FramerSources::read_dir(dir)?;
    let summary = import_framer(db, &sources)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Import complete.\n");
        print_stage("Tag cats:", &summary.tag_categories);
        print_stage("Ingr. cats:", &summary.ingredient_categories);
        print_stage("Tags:", &summary.tags);
        print_stage("Ingredients:", &summary.ingredients);
        print_stage("Recipes:", &summary.recipes);
    }
    Ok(())
}

use anyhow::Result;
use std::process;

use potluck_core::db::Database;
use potluck_core::error::StoreError;
use potluck_core::filter::RecipeQuery;
use potluck_core::service::{admin_browse_recipes, recipe_page};

use super::helpers::{json_error, print_recipe_table, tag_names};

pub(crate) fn cmd_recipe_list(
    db: &Database,
    tags: Option<&str>,
    search: Option<&str>,
    json: bool,
) -> Result<()> {
    let query = RecipeQuery::from_params(tags, search);
    let recipes = admin_browse_recipes(db, &query)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&recipes)?);
    } else if recipes.is_empty() {
        println!("No recipes found.");
    } else {
        print_recipe_table(&recipes);
    }
    Ok(())
}

pub(crate) fn cmd_recipe_show(db: &Database, slug: &str, json: bool) -> Result<()> {
    let detail = recipe_page(db, slug)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let recipe = &detail.recipe;
    println!("{} ({})", recipe.name, recipe.slug);
    if let Some(url) = &recipe.image_url {
        println!("  Image:       {url}");
    }
    if !detail.tags.is_empty() {
        println!("  Tags:        {}", tag_names(&detail.tags));
    }
    println!("  Updated:     {}", recipe.updated_at);

    if !detail.ingredients.is_empty() {
        println!("\nIngredients:");
        for line in &detail.ingredients {
            let notes = if line.notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", line.notes)
            };
            let parts: Vec<&str> = [line.quantity.as_str(), line.tag_name.as_deref().unwrap_or("?")]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect();
            println!("  - {}{notes}", parts.join(" "));
        }
    }
    for (label, html) in [
        ("Ingredients (text)", &detail.ingredients_html),
        ("Instructions", &detail.instructions_html),
        ("Inspiration", &detail.inspiration_html),
    ] {
        if !html.is_empty() {
            println!("\n{label}:\n{html}");
        }
    }
    Ok(())
}

pub(crate) fn cmd_recipe_delete(db: &Database, slug: &str, json: bool) -> Result<()> {
    let recipe = match db.get_recipe_by_slug(slug) {
        Ok(recipe) => recipe,
        Err(e) if matches!(StoreError::find(&e), Some(StoreError::NotFound(_))) => {
            if json {
                println!("{}", json_error(&format!("Recipe '{slug}' not found")));
            } else {
                eprintln!("Recipe '{slug}' not found");
            }
            process::exit(2);
        }
        Err(e) => return Err(e),
    };

    db.delete_recipe(recipe.id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": recipe.slug }));
    } else {
        println!("Deleted recipe: {} ({})", recipe.name, recipe.slug);
    }
    Ok(())
}

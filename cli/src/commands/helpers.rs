use anyhow::Result;
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{Table, Tabled, settings::Style};

use potluck_core::import::StageSummary;
use potluck_core::models::{RecipeListing, TagRef};
use potluck_core::service::parse_month;

/// A day inside the requested `YYYY-MM` month; `None` means today.
pub(crate) fn month_start(month: Option<String>) -> Result<NaiveDate> {
    match month {
        None => Ok(Local::now().date_naive()),
        Some(m) => parse_month(&m),
    }
}

pub(crate) fn tag_names(tags: &[TagRef]) -> String {
    tags.iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn print_recipe_table(recipes: &[RecipeListing]) {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Slug")]
        slug: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Tags")]
        tags: String,
        #[tabled(rename = "Ingredients")]
        ingredients: String,
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: r.id,
            slug: truncate(&r.slug, 30),
            name: truncate(&r.name, 35),
            tags: truncate(&tag_names(&r.tags), 30),
            ingredients: truncate(&tag_names(&r.ingredient_tags), 30),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}

pub(crate) fn print_stage(label: &str, stage: &StageSummary) {
    println!(
        "  {label:<11} {} created, {} existing, {} skipped, {} failed",
        stage.created, stage.existing, stage.skipped, stage.failed
    );
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_start() {
        assert_eq!(
            month_start(Some("2024-02".to_string())).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
        assert_eq!(month_start(None).unwrap(), Local::now().date_naive());
        assert!(month_start(Some("Feb".to_string())).is_err());
    }

    #[test]
    fn test_tag_names() {
        let tags = vec![
            TagRef {
                id: 1,
                name: "Thai".into(),
            },
            TagRef {
                id: 2,
                name: "Quick".into(),
            },
        ];
        assert_eq!(tag_names(&tags), "Thai, Quick");
        assert_eq!(tag_names(&[]), "");
    }

    #[test]
    fn test_json_error() {
        assert_eq!(json_error("nope"), r#"{"error":"nope"}"#);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world this is long", 10), "hello w...");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("Crème brûlée tart", 10), "Crème b...");
        assert_eq!(truncate("Phở bò", 10), "Phở bò");
    }
}

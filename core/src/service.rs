use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::document::{normalize_document, render_html};
use crate::error::StoreError;
use crate::filter::{RecipeQuery, filter_recipes};
use crate::models::{
    CalendarEntry, IngredientLine, IngredientRow, IngredientSource, MEAL_SLOTS, MealSlot,
    NewCalendarEntry, NewRecipe, RecipeDetail, RecipeListing, slugify, validate_recipe_fields,
};

// --- Recipe pages ---

/// Public recipe list: ingredient tags come from the structured rows.
pub fn browse_recipes(db: &Database, query: &RecipeQuery) -> Result<Vec<RecipeListing>> {
    let listings = db.list_recipe_listings(IngredientSource::Structured)?;
    let groups = db.list_tag_groups_with_tags()?;
    Ok(filter_recipes(listings, &groups, query))
}

/// Management list: ingredient tags come from the join table.
pub fn admin_browse_recipes(db: &Database, query: &RecipeQuery) -> Result<Vec<RecipeListing>> {
    let listings = db.list_recipe_listings(IngredientSource::JoinTable)?;
    let groups = db.list_tag_groups_with_tags()?;
    Ok(filter_recipes(listings, &groups, query))
}

/// The user's favorites, most recently favorited first.
pub fn favorite_recipes(
    db: &Database,
    user_id: i64,
    query: &RecipeQuery,
) -> Result<Vec<RecipeListing>> {
    let ids = db.favorite_recipe_ids(user_id)?;
    let mut by_id: HashMap<i64, RecipeListing> = db
        .list_recipe_listings(IngredientSource::Structured)?
        .into_iter()
        .map(|l| (l.id, l))
        .collect();
    let favorites = ids.iter().filter_map(|id| by_id.remove(id)).collect();
    let groups = db.list_tag_groups_with_tags()?;
    Ok(filter_recipes(favorites, &groups, query))
}

pub fn recipe_page(db: &Database, slug: &str) -> Result<RecipeDetail> {
    let recipe = db.get_recipe_by_slug(slug)?;
    let tags = db.recipe_tags(recipe.id)?;
    let ingredient_tags = db.recipe_ingredient_tags(recipe.id)?;
    let names = db.tag_names_by_id()?;

    let ingredients = recipe
        .ingredients_structured
        .iter()
        .map(|row| IngredientLine {
            quantity: row.quantity.clone(),
            tag_id: row.tag_id,
            tag_name: row.tag_id.and_then(|id| names.get(&id).cloned()),
            notes: row.notes.clone(),
        })
        .collect();

    Ok(RecipeDetail {
        ingredients_html: render_html(&recipe.ingredients_text),
        instructions_html: render_html(&recipe.instructions),
        inspiration_html: render_html(&recipe.inspiration),
        recipe,
        tags,
        ingredient_tags,
        ingredients,
    })
}

/// Recipe editor payload. Rich fields may be documents or plain text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeForm {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub ingredients_text: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub inspiration: String,
    #[serde(default)]
    pub ingredients_structured: Vec<IngredientRow>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    #[serde(default)]
    pub ingredient_tag_ids: Option<Vec<i64>>,
}

impl RecipeForm {
    /// Validate and normalise into a store record.
    ///
    /// Without explicit `ingredient_tag_ids`, the join rows mirror the tags
    /// referenced by the structured rows.
    pub fn into_new_recipe(self, created_by: Option<i64>) -> Result<NewRecipe> {
        let name = self.name.trim().to_string();
        let slug = self
            .slug
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&name));
        validate_recipe_fields(&name, &slug)?;

        let ingredient_tag_ids = self.ingredient_tag_ids.unwrap_or_else(|| {
            let mut seen = HashSet::new();
            self.ingredients_structured
                .iter()
                .filter_map(|row| row.tag_id)
                .filter(|id| seen.insert(*id))
                .collect()
        });

        Ok(NewRecipe {
            slug,
            name,
            image_url: self.image_url.filter(|u| !u.trim().is_empty()),
            ingredients_text: normalize_document(&self.ingredients_text),
            instructions: normalize_document(&self.instructions),
            inspiration: normalize_document(&self.inspiration),
            ingredients_structured: self.ingredients_structured,
            tag_ids: self.tag_ids,
            ingredient_tag_ids,
            created_by,
            created_at: None,
            updated_at: None,
        })
    }
}

// --- Meal calendar ---

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
        StoreError::Invalid(format!("Invalid date '{s}'. Use YYYY-MM-DD")).into()
    })
}

/// Parse `YYYY-MM` into the first day of that month.
pub fn parse_month(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", s.trim()), "%Y-%m-%d").map_err(|_| {
        StoreError::Invalid(format!("Invalid month '{s}'. Use YYYY-MM")).into()
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub in_month: bool,
    pub entries: Vec<CalendarEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthCalendar {
    pub year: i32,
    pub month: u32,
    /// Whole weeks, Monday first, covering the month.
    pub days: Vec<CalendarDay>,
}

pub fn schedule_recipe(
    db: &Database,
    user_id: i64,
    date: NaiveDate,
    meal: MealSlot,
    recipe_id: i64,
    notes: Option<String>,
) -> Result<CalendarEntry> {
    let entry = db.upsert_calendar_entry(&NewCalendarEntry {
        user_id,
        recipe_id,
        date,
        meal_type: meal,
        notes: notes.filter(|n| !n.trim().is_empty()),
    })?;
    tracing::debug!(user_id, %date, %meal, recipe_id, "scheduled recipe");
    Ok(entry)
}

fn month_out_of_range() -> anyhow::Error {
    StoreError::Invalid("Month out of range".to_string()).into()
}

pub fn month_calendar(db: &Database, user_id: i64, month_start: NaiveDate) -> Result<MonthCalendar> {
    let first = month_start.with_day(1).context("Invalid month start")?;
    let next_month = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .ok_or_else(month_out_of_range)?;
    let last = next_month.pred_opt().ok_or_else(month_out_of_range)?;

    let grid_start = first
        .checked_sub_signed(Duration::days(i64::from(first.weekday().num_days_from_monday())))
        .ok_or_else(month_out_of_range)?;
    let grid_end = last
        .checked_add_signed(Duration::days(6 - i64::from(last.weekday().num_days_from_monday())))
        .ok_or_else(month_out_of_range)?;

    let mut by_date: HashMap<String, Vec<CalendarEntry>> = HashMap::new();
    for entry in db.calendar_entries_between(user_id, grid_start, grid_end)? {
        by_date.entry(entry.date.clone()).or_default().push(entry);
    }

    let days = grid_start
        .iter_days()
        .take_while(|d| *d <= grid_end)
        .map(|date| CalendarDay {
            date,
            in_month: date.month() == first.month(),
            entries: by_date
                .remove(&date.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        })
        .collect();

    Ok(MonthCalendar {
        year: first.year(),
        month: first.month(),
        days,
    })
}

/// First slot of the day with nothing scheduled; breakfast when the day is full.
pub fn next_open_slot(db: &Database, user_id: i64, date: NaiveDate) -> Result<MealSlot> {
    let taken: HashSet<MealSlot> = db
        .calendar_entries_between(user_id, date, date)?
        .into_iter()
        .map(|e| e.meal_type)
        .collect();
    Ok(MEAL_SLOTS
        .into_iter()
        .find(|slot| !taken.contains(slot))
        .unwrap_or(MealSlot::Breakfast))
}

pub fn unschedule(db: &Database, user_id: i64, entry_id: i64) -> Result<()> {
    if !db.delete_calendar_entry(user_id, entry_id)? {
        bail!(StoreError::NotFound(format!("Calendar entry {entry_id} not found")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTagGroup, UserRole};

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("cook@example.com", UserRole::Viewer, "hash").unwrap();
        (db, user.id)
    }

    fn add_recipe(db: &Database, name: &str, tag_ids: Vec<i64>, rows: Vec<IngredientRow>) -> i64 {
        let form = RecipeForm {
            name: name.to_string(),
            ingredients_text: "- Rice noodles\n- Chicken".to_string(),
            ingredients_structured: rows,
            tag_ids,
            ..RecipeForm::default()
        };
        db.insert_recipe(&form.into_new_recipe(None).unwrap()).unwrap().id
    }

    #[test]
    fn test_browse_filters_by_structured_ingredients() {
        let (db, _) = setup();
        let (cuisine, _) = db
            .ensure_tag_group(&NewTagGroup { name: "Cuisine".into(), display_order: 0, kind: None })
            .unwrap();
        let (protein, _) = db
            .ensure_tag_group(&NewTagGroup { name: "Protein".into(), display_order: 1, kind: None })
            .unwrap();
        let thai = db.insert_tag(cuisine.id, "Thai").unwrap();
        let chicken = db.insert_tag(protein.id, "Chicken").unwrap();

        add_recipe(&db, "Pad Thai", vec![thai.id], vec![IngredientRow::for_tag(chicken.id)]);
        add_recipe(&db, "Green Curry", vec![thai.id], vec![]);

        let all = browse_recipes(&db, &RecipeQuery::default()).unwrap();
        assert_eq!(all.len(), 2);

        let with_chicken =
            browse_recipes(&db, &RecipeQuery::from_params(Some(&chicken.id.to_string()), None)).unwrap();
        assert_eq!(with_chicken.len(), 1);
        assert_eq!(with_chicken[0].name, "Pad Thai");

        let searched = browse_recipes(&db, &RecipeQuery::from_params(None, Some("curry"))).unwrap();
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].slug, "green-curry");

        // Join rows mirror the structured rows, so the admin view agrees
        let admin =
            admin_browse_recipes(&db, &RecipeQuery::from_params(Some(&chicken.id.to_string()), None)).unwrap();
        assert_eq!(admin.len(), 1);
    }

    #[test]
    fn test_recipe_page_renders_fields() {
        let (db, _) = setup();
        let (pantry, _) = db
            .ensure_tag_group(&NewTagGroup { name: "Pantry".into(), display_order: 0, kind: None })
            .unwrap();
        let noodles = db.insert_tag(pantry.id, "Rice noodles").unwrap();
        let id = add_recipe(&db, "Pad Thai", vec![], vec![]);
        // A row pointing at a deleted tag keeps its text but loses the name
        let rows = vec![
            IngredientRow {
                quantity: "200 g".into(),
                tag_id: Some(noodles.id),
                notes: "soaked".into(),
            },
            IngredientRow {
                quantity: "1".into(),
                tag_id: Some(9999),
                notes: String::new(),
            },
        ];
        db.set_structured_ingredients(id, &rows).unwrap();

        let page = recipe_page(&db, "pad-thai").unwrap();
        assert_eq!(page.ingredients_html, "<ul><li>Rice noodles</li><li>Chicken</li></ul>");
        assert_eq!(page.ingredients[0].tag_name.as_deref(), Some("Rice noodles"));
        assert_eq!(page.ingredients[1].tag_name, None);
        assert_eq!(page.instructions_html, "");

        let err = recipe_page(&db, "nope").unwrap_err();
        assert!(matches!(StoreError::find(&err), Some(StoreError::NotFound(_))));
    }

    #[test]
    fn test_recipe_form_validation() {
        let form = RecipeForm {
            name: "  ".into(),
            ..RecipeForm::default()
        };
        assert!(form.into_new_recipe(None).is_err());

        let form = RecipeForm {
            name: "Khao Soi".into(),
            slug: Some(String::new()),
            instructions: r#"{"type":"doc","content":[]}"#.into(),
            ..RecipeForm::default()
        };
        let recipe = form.into_new_recipe(Some(1)).unwrap();
        assert_eq!(recipe.slug, "khao-soi");
        assert_eq!(recipe.instructions, r#"{"type":"doc","content":[]}"#);
        assert_eq!(recipe.created_by, Some(1));
    }

    #[test]
    fn test_favorite_recipes_in_favorite_order() {
        let (db, user) = setup();
        let a = add_recipe(&db, "Alpha", vec![], vec![]);
        let b = add_recipe(&db, "Beta", vec![], vec![]);
        add_recipe(&db, "Gamma", vec![], vec![]);
        db.add_favorite(user, b).unwrap();
        db.add_favorite(user, a).unwrap();

        let favs = favorite_recipes(&db, user, &RecipeQuery::default()).unwrap();
        let names: Vec<&str> = favs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
    }

    #[test]
    fn test_schedule_replaces_slot() {
        let (db, user) = setup();
        let a = add_recipe(&db, "Alpha", vec![], vec![]);
        let b = add_recipe(&db, "Beta", vec![], vec![]);
        let date = parse_date("2024-03-05").unwrap();

        schedule_recipe(&db, user, date, MealSlot::Dinner, a, None).unwrap();
        let entry = schedule_recipe(&db, user, date, MealSlot::Dinner, b, Some("double".into())).unwrap();
        assert_eq!(entry.recipe_name, "Beta");
        assert_eq!(entry.notes.as_deref(), Some("double"));
        assert_eq!(db.calendar_entries_between(user, date, date).unwrap().len(), 1);
    }

    #[test]
    fn test_month_calendar_grid() {
        let (db, user) = setup();
        let a = add_recipe(&db, "Alpha", vec![], vec![]);
        // March 2024 starts on a Friday and ends on a Sunday
        schedule_recipe(&db, user, parse_date("2024-02-26").unwrap(), MealSlot::Lunch, a, None).unwrap();
        schedule_recipe(&db, user, parse_date("2024-03-15").unwrap(), MealSlot::Dinner, a, None).unwrap();
        schedule_recipe(&db, user, parse_date("2024-03-15").unwrap(), MealSlot::Breakfast, a, None).unwrap();

        let month = month_calendar(&db, user, parse_month("2024-03").unwrap()).unwrap();
        assert_eq!(month.days.len(), 35);
        assert_eq!(month.days[0].date, parse_date("2024-02-26").unwrap());
        assert!(!month.days[0].in_month);
        assert_eq!(month.days[0].entries.len(), 1);
        assert_eq!(month.days[34].date, parse_date("2024-03-31").unwrap());

        let ides = month.days.iter().find(|d| d.date.day() == 15 && d.in_month).unwrap();
        let slots: Vec<MealSlot> = ides.entries.iter().map(|e| e.meal_type).collect();
        assert_eq!(slots, vec![MealSlot::Breakfast, MealSlot::Dinner]);
    }

    #[test]
    fn test_month_calendar_at_date_limits() {
        let (db, user) = setup();
        for edge in [NaiveDate::MIN, NaiveDate::MAX] {
            let err = month_calendar(&db, user, edge).unwrap_err();
            assert!(matches!(StoreError::find(&err), Some(StoreError::Invalid(_))));
        }
    }

    #[test]
    fn test_next_open_slot() {
        let (db, user) = setup();
        let a = add_recipe(&db, "Alpha", vec![], vec![]);
        let date = parse_date("2024-03-05").unwrap();
        assert_eq!(next_open_slot(&db, user, date).unwrap(), MealSlot::Breakfast);

        schedule_recipe(&db, user, date, MealSlot::Breakfast, a, None).unwrap();
        assert_eq!(next_open_slot(&db, user, date).unwrap(), MealSlot::Lunch);

        schedule_recipe(&db, user, date, MealSlot::Lunch, a, None).unwrap();
        schedule_recipe(&db, user, date, MealSlot::Dinner, a, None).unwrap();
        assert_eq!(next_open_slot(&db, user, date).unwrap(), MealSlot::Breakfast);
    }

    #[test]
    fn test_unschedule_only_own_entries() {
        let (db, user) = setup();
        let other = db.insert_user("other@example.com", UserRole::Viewer, "hash2").unwrap();
        let a = add_recipe(&db, "Alpha", vec![], vec![]);
        let entry =
            schedule_recipe(&db, user, parse_date("2024-03-05").unwrap(), MealSlot::Lunch, a, None).unwrap();

        assert!(unschedule(&db, other.id, entry.id).is_err());
        unschedule(&db, user, entry.id).unwrap();
        assert!(unschedule(&db, user, entry.id).is_err());
    }

    #[test]
    fn test_parse_date_and_month() {
        assert!(parse_date("2024-02-30").is_err());
        assert_eq!(parse_month("2024-12").unwrap(), parse_date("2024-12-01").unwrap());
        assert!(parse_month("2024-13").is_err());
    }
}

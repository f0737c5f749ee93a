use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Recipe,
    Ingredient,
}

impl GroupKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recipe => "recipe",
            Self::Ingredient => "ingredient",
        }
    }
}

impl FromStr for GroupKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "recipe" => Ok(Self::Recipe),
            "ingredient" => Ok(Self::Ingredient),
            _ => bail!(StoreError::Invalid(format!(
                "Invalid group kind '{s}'. Must be one of: recipe, ingredient"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagGroup {
    pub id: i64,
    pub name: String,
    pub display_order: i64,
    /// `None` means the group is classified by its name.
    pub kind: Option<GroupKind>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub tag_group_id: i64,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagGroupWithTags {
    #[serde(flatten)]
    pub group: TagGroup,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone)]
pub struct NewTagGroup {
    pub name: String,
    pub display_order: i64,
    pub kind: Option<GroupKind>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTagGroup {
    pub name: Option<String>,
    pub display_order: Option<i64>,
    pub kind: Option<Option<GroupKind>>,
}

/// A tag id paired with its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub id: i64,
    pub name: String,
}

/// One line of a recipe's structured ingredient list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngredientRow {
    #[serde(default)]
    pub quantity: String,
    #[serde(rename = "tagId", default)]
    pub tag_id: Option<i64>,
    #[serde(default)]
    pub notes: String,
}

impl IngredientRow {
    #[must_use]
    pub fn for_tag(tag_id: i64) -> Self {
        Self {
            quantity: String::new(),
            tag_id: Some(tag_id),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub image_url: Option<String>,
    pub ingredients_text: String,
    pub instructions: String,
    pub inspiration: String,
    pub ingredients_structured: Vec<IngredientRow>,
    pub created_by: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewRecipe {
    pub slug: String,
    pub name: String,
    pub image_url: Option<String>,
    pub ingredients_text: String,
    pub instructions: String,
    pub inspiration: String,
    pub ingredients_structured: Vec<IngredientRow>,
    pub tag_ids: Vec<i64>,
    pub ingredient_tag_ids: Vec<i64>,
    pub created_by: Option<i64>,
    // Set by importers that carry timestamps from an external system.
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Recipe summary used by list pages and the tag filter.
#[derive(Debug, Clone, Serialize)]
pub struct RecipeListing {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub image_url: Option<String>,
    pub created_at: String,
    pub tags: Vec<TagRef>,
    pub ingredient_tags: Vec<TagRef>,
}

/// Where a listing's ingredient tags come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngredientSource {
    /// The `ingredients_structured` rows on the recipe.
    Structured,
    /// The `recipe_ingredients` join table.
    JoinTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngredientLine {
    pub quantity: String,
    pub tag_id: Option<i64>,
    pub tag_name: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeDetail {
    #[serde(flatten)]
    pub recipe: Recipe,
    pub tags: Vec<TagRef>,
    pub ingredient_tags: Vec<TagRef>,
    pub ingredients: Vec<IngredientLine>,
    pub ingredients_html: String,
    pub instructions_html: String,
    pub inspiration_html: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealSlot {
    Breakfast,
    Lunch,
    Dinner,
}

pub const MEAL_SLOTS: [MealSlot; 3] = [MealSlot::Breakfast, MealSlot::Lunch, MealSlot::Dinner];

impl MealSlot {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::Dinner => "dinner",
        }
    }
}

impl fmt::Display for MealSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealSlot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        validate_meal_slot(s)
    }
}

pub fn validate_meal_slot(meal: &str) -> Result<MealSlot> {
    match meal.trim().to_lowercase().as_str() {
        "breakfast" => Ok(MealSlot::Breakfast),
        "lunch" => Ok(MealSlot::Lunch),
        "dinner" => Ok(MealSlot::Dinner),
        _ => bail!(StoreError::Invalid(format!(
            "Invalid meal slot '{meal}'. Must be one of: breakfast, lunch, dinner"
        ))),
    }
}

/// Ordered so that `Admin > Contributor > Viewer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Viewer,
    Contributor,
    Admin,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Contributor => "contributor",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn allows(self, required: UserRole) -> bool {
        self >= required
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "viewer" => Ok(Self::Viewer),
            "contributor" => Ok(Self::Contributor),
            "admin" => Ok(Self::Admin),
            _ => bail!(StoreError::Invalid(format!(
                "Invalid role '{s}'. Must be one of: viewer, contributor, admin"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: UserRole,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarEntry {
    pub id: i64,
    pub user_id: i64,
    pub recipe_id: i64,
    pub date: String,
    pub meal_type: MealSlot,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    // Joined for display
    pub recipe_name: String,
    pub recipe_slug: String,
}

#[derive(Debug, Clone)]
pub struct NewCalendarEntry {
    pub user_id: i64,
    pub recipe_id: i64,
    pub date: chrono::NaiveDate,
    pub meal_type: MealSlot,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillSummary {
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Lowercase, collapse every run of non-alphanumerics to `-`, trim dashes.
///
/// Names written only in non-Latin scripts slug to `recipe-` plus the first
/// eight hex digits of the name's SHA-256, so re-imports land on the same slug.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() && name.chars().any(char::is_alphanumeric) {
        let digest = hash_token(name.trim());
        slug = format!("recipe-{}", &digest[..8]);
    }
    slug
}

pub fn validate_recipe_fields(name: &str, slug: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!(StoreError::Invalid("Recipe name is required".to_string()));
    }
    if slug.is_empty() {
        bail!(StoreError::Invalid("Recipe slug is required".to_string()));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(StoreError::Invalid(format!(
            "Invalid slug '{slug}'. Use lowercase letters, digits and dashes"
        )));
    }
    Ok(())
}

pub fn validate_name(kind: &str, name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!(StoreError::Invalid(format!("{kind} name is required")));
    }
    Ok(trimmed.to_string())
}

/// Hex-encoded SHA-256 of an API token, the form tokens are stored in.
#[must_use]
pub fn hash_token(token: &str) -> String {
    use std::fmt::Write;

    Sha256::digest(token.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

//! Tag partition and recipe filtering.
//!
//! Selected tags split into two categories: recipe tags (cuisine, course, ...)
//! and ingredient tags. A recipe must carry at least one selected tag from
//! every non-empty category.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::models::{GroupKind, RecipeListing, TagGroupWithTags};

/// Group-name fragments that mark a group as holding ingredient tags when
/// the group has no explicit kind.
pub const INGREDIENT_GROUP_KEYWORDS: &[&str] = &["ingredient", "protein", "veggie", "carb", "dairy"];

#[must_use]
pub fn is_ingredient_group_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    INGREDIENT_GROUP_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagSelection {
    pub recipe_tag_ids: Vec<i64>,
    pub ingredient_tag_ids: Vec<i64>,
}

impl TagSelection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipe_tag_ids.is_empty() && self.ingredient_tag_ids.is_empty()
    }
}

/// Filter input for recipe list pages, parsed from the request each time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeQuery {
    pub tag_ids: Vec<i64>,
    pub search: Option<String>,
}

impl RecipeQuery {
    /// Build a query from the raw `tags` (comma-separated ids) and `search`
    /// parameters. Pieces that are not integers are ignored.
    #[must_use]
    pub fn from_params(tags: Option<&str>, search: Option<&str>) -> Self {
        let tag_ids = tags
            .unwrap_or_default()
            .split(',')
            .filter_map(|piece| piece.trim().parse::<i64>().ok())
            .collect();
        let search = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self { tag_ids, search }
    }
}

/// Every tag id that some listing uses as an ingredient.
#[must_use]
pub fn ingredient_corpus(listings: &[RecipeListing]) -> HashSet<i64> {
    listings
        .iter()
        .flat_map(|l| l.ingredient_tags.iter().map(|t| t.id))
        .collect()
}

/// Split selected tag ids into recipe and ingredient categories.
///
/// A group's explicit kind decides. Groups without one fall back to the name
/// keywords, and then to whether the tag shows up in `corpus`. Ids not found
/// in any group are dropped. Output keeps first-seen order without duplicates.
#[must_use]
pub fn partition_tags(
    selected: &[i64],
    groups: &[TagGroupWithTags],
    corpus: &HashSet<i64>,
) -> TagSelection {
    let mut owner: HashMap<i64, (Option<GroupKind>, String)> = HashMap::new();
    for g in groups {
        for tag in &g.tags {
            owner.insert(tag.id, (g.group.kind, g.group.name.to_lowercase()));
        }
    }

    let mut seen = HashSet::new();
    let mut selection = TagSelection::default();
    for &id in selected {
        if !seen.insert(id) {
            continue;
        }
        let Some((kind, group_name)) = owner.get(&id) else {
            continue;
        };
        let is_ingredient = match kind {
            Some(GroupKind::Ingredient) => true,
            Some(GroupKind::Recipe) => false,
            None => is_ingredient_group_name(group_name) || corpus.contains(&id),
        };
        if is_ingredient {
            selection.ingredient_tag_ids.push(id);
        } else {
            selection.recipe_tag_ids.push(id);
        }
    }
    selection
}

/// OR within a category, AND across categories.
#[must_use]
pub fn matches_tags(listing: &RecipeListing, selection: &TagSelection) -> bool {
    let recipe_ok = selection.recipe_tag_ids.is_empty()
        || listing
            .tags
            .iter()
            .any(|t| selection.recipe_tag_ids.contains(&t.id));
    let ingredient_ok = selection.ingredient_tag_ids.is_empty()
        || listing
            .ingredient_tags
            .iter()
            .any(|t| selection.ingredient_tag_ids.contains(&t.id));
    recipe_ok && ingredient_ok
}

/// Case-insensitive substring match on the name, tag names and ingredient
/// tag names. A blank query matches everything.
#[must_use]
pub fn matches_search(listing: &RecipeListing, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    listing.name.to_lowercase().contains(&needle)
        || listing
            .tags
            .iter()
            .chain(&listing.ingredient_tags)
            .any(|t| t.name.to_lowercase().contains(&needle))
}

/// Apply search then the tag filter, preserving input order.
///
/// The ingredient corpus is taken from the full candidate list so that the
/// tag classification does not depend on the search text.
#[must_use]
pub fn filter_recipes(
    listings: Vec<RecipeListing>,
    groups: &[TagGroupWithTags],
    query: &RecipeQuery,
) -> Vec<RecipeListing> {
    let corpus = ingredient_corpus(&listings);
    let selection = partition_tags(&query.tag_ids, groups, &corpus);
    let search = query.search.as_deref().unwrap_or_default();

    listings
        .into_iter()
        .filter(|l| matches_search(l, search))
        .filter(|l| matches_tags(l, &selection))
        .collect()
}

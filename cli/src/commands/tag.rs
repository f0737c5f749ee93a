use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use potluck_core::db::Database;
use potluck_core::filter::is_ingredient_group_name;
use potluck_core::models::{GroupKind, NewTagGroup, TagGroup, validate_name};

pub(crate) fn cmd_tag_group_list(db: &Database, json: bool) -> Result<()> {
    let groups = db.list_tag_groups_with_tags()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }
    if groups.is_empty() {
        println!("No tag groups. Add one with: potluck tag-group add <name>");
        return Ok(());
    }
    for g in &groups {
        let kind = kind_label(&g.group);
        println!(
            "{} (id: {}, order: {}, {kind})",
            g.group.name, g.group.id, g.group.display_order
        );
        for tag in &g.tags {
            println!("  - {} (id: {})", tag.name, tag.id);
        }
    }
    Ok(())
}

fn kind_label(group: &TagGroup) -> &'static str {
    match group.kind {
        Some(kind) => kind.as_str(),
        None if is_ingredient_group_name(&group.name) => "ingredient by name",
        None => "recipe by name",
    }
}

pub(crate) fn cmd_tag_group_add(
    db: &Database,
    name: &str,
    order: i64,
    kind: Option<&str>,
    json: bool,
) -> Result<()> {
    let kind = kind.map(str::parse::<GroupKind>).transpose()?;
    let group = db.insert_tag_group(&NewTagGroup {
        name: validate_name("Tag group", name)?,
        display_order: order,
        kind,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&group)?);
    } else {
        println!("Created tag group: {} (id: {})", group.name, group.id);
    }
    Ok(())
}

pub(crate) fn cmd_tag_add(db: &Database, group_name: &str, name: &str, json: bool) -> Result<()> {
    let Some(group) = db.get_tag_group_by_name(group_name)? else {
        bail!("Tag group '{group_name}' not found");
    };
    let tag = db.insert_tag(group.id, &validate_name("Tag", name)?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tag)?);
    } else {
        println!("Created tag: {} in {} (id: {})", tag.name, group.name, tag.id);
    }
    Ok(())
}

pub(crate) fn cmd_tag_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct TagRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Group")]
        group: String,
    }

    let tags = db.list_tags()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tags)?);
        return Ok(());
    }
    if tags.is_empty() {
        println!("No tags.");
        return Ok(());
    }

    let groups = db.list_tag_groups()?;
    let rows: Vec<TagRow> = tags
        .iter()
        .map(|t| TagRow {
            id: t.id,
            name: t.name.clone(),
            group: groups
                .iter()
                .find(|g| g.id == t.tag_group_id)
                .map(|g| g.name.clone())
                .unwrap_or_default(),
        })
        .collect();
    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_group_and_tag_add() {
        let db = Database::open_in_memory().unwrap();
        cmd_tag_group_add(&db, "Main Ingredients", 1, None, false).unwrap();
        cmd_tag_group_add(&db, "Cuisine", 2, Some("recipe"), true).unwrap();
        cmd_tag_add(&db, "Cuisine", "Thai", false).unwrap();
        cmd_tag_group_list(&db, false).unwrap();
        cmd_tag_list(&db, false).unwrap();

        let groups = db.list_tag_groups_with_tags().unwrap();
        let cuisine = groups.iter().find(|g| g.group.name == "Cuisine").unwrap();
        assert_eq!(cuisine.group.kind, Some(GroupKind::Recipe));
        assert_eq!(cuisine.tags[0].name, "Thai");

        let main = groups.iter().find(|g| g.group.name == "Main Ingredients").unwrap();
        assert_eq!(kind_label(&main.group), "ingredient by name");
    }

    #[test]
    fn test_tag_group_add_rejects_bad_kind() {
        let db = Database::open_in_memory().unwrap();
        assert!(cmd_tag_group_add(&db, "Cuisine", 0, Some("spice"), false).is_err());
        assert!(db.list_tag_groups().unwrap().is_empty());
    }

    #[test]
    fn test_tag_add_unknown_group() {
        let db = Database::open_in_memory().unwrap();
        let err = cmd_tag_add(&db, "Nope", "Thai", false).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

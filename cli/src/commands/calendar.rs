use anyhow::{Result, bail};

use potluck_core::db::Database;
use potluck_core::service::month_calendar;

use super::helpers::{month_start, truncate};

pub(crate) fn cmd_calendar_show(
    db: &Database,
    email: &str,
    month: Option<String>,
    json: bool,
) -> Result<()> {
    let Some(user) = db.get_user_by_email(email)? else {
        bail!("User '{email}' not found");
    };
    let calendar = month_calendar(db, user.id, month_start(month)?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&calendar)?);
        return Ok(());
    }

    println!("{} {:04}-{:02}\n", user.email, calendar.year, calendar.month);
    let mut any = false;
    for day in calendar.days.iter().filter(|d| d.in_month && !d.entries.is_empty()) {
        any = true;
        println!("{}", day.date.format("%a %Y-%m-%d"));
        for entry in &day.entries {
            let notes = entry
                .notes
                .as_deref()
                .map(|n| format!("  ({})", truncate(n, 40)))
                .unwrap_or_default();
            println!(
                "  {:<10} {} [{}]{notes}",
                entry.meal_type.as_str(),
                entry.recipe_name,
                entry.recipe_slug
            );
        }
    }
    if !any {
        println!("Nothing scheduled.");
    }
    Ok(())
}

use anyhow::Result;

use potluck_core::db::Database;

pub(crate) fn cmd_migrate_structured(db: &Database, json: bool) -> Result<()> {
    let summary = db.backfill_structured_ingredients()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Structured ingredient backfill complete.\n");
        println!("  Processed: {}", summary.processed);
        println!("  Updated:   {}", summary.updated);
        println!("  Skipped:   {}", summary.skipped);
    }
    Ok(())
}

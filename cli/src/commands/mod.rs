mod calendar;
mod helpers;
mod import;
mod migrate;
mod recipe;
mod tag;
mod user;

pub(crate) use calendar::cmd_calendar_show;
pub(crate) use import::{CsvFiles, cmd_import_cms, cmd_import_csv, cmd_import_framer};
pub(crate) use migrate::cmd_migrate_structured;
pub(crate) use recipe::{cmd_recipe_delete, cmd_recipe_list, cmd_recipe_show};
pub(crate) use tag::{cmd_tag_add, cmd_tag_group_add, cmd_tag_group_list, cmd_tag_list};
pub(crate) use user::{cmd_user_add, cmd_user_list, cmd_user_rotate_token, cmd_user_set_role};

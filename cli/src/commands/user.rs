use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use potluck_core::db::Database;
use potluck_core::models::{UserRole, hash_token};

use crate::config::generate_token;

pub(crate) fn cmd_user_add(db: &Database, email: &str, role: &str, json: bool) -> Result<()> {
    let role: UserRole = role.parse()?;
    let token = generate_token();
    let user = db.insert_user(email, role, &hash_token(&token))?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "user": user, "token": token })
        );
    } else {
        println!("Created user: {} ({})", user.email, user.role);
        println!("API token (shown once): {token}");
    }
    Ok(())
}

pub(crate) fn cmd_user_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct UserRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Role")]
        role: String,
        #[tabled(rename = "Created")]
        created: String,
    }

    let users = db.list_users()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }
    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }

    let rows: Vec<UserRow> = users
        .iter()
        .map(|u| UserRow {
            id: u.id,
            email: u.email.clone(),
            role: u.role.to_string(),
            created: u.created_at.chars().take(10).collect(),
        })
        .collect();
    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_user_set_role(db: &Database, email: &str, role: &str, json: bool) -> Result<()> {
    let role: UserRole = role.parse()?;
    let user = db.set_user_role(email, role)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        println!("{} is now {}", user.email, user.role);
    }
    Ok(())
}

pub(crate) fn cmd_user_rotate_token(db: &Database, email: &str, json: bool) -> Result<()> {
    let token = generate_token();
    db.set_user_token(email, &hash_token(&token))?;
    if json {
        println!("{}", serde_json::json!({ "email": email, "token": token }));
    } else {
        println!("New API token for {email} (shown once): {token}");
    }
    Ok(())
}

//! Emergency contact repository implementation

use crate::error::Result;
use crate::models::EmergencyContact;
use libsql::{params, Connection};

/// Trait for contact storage operations (async)
///
/// Contacts are owned by a separate subsystem; the dispatch core only
/// reads them to know who to notify.
#[allow(async_fn_in_trait)]
pub trait ContactRepository {
    /// Persist a contact
    async fn insert(&self, contact: &EmergencyContact) -> Result<()>;

    /// List enabled contacts for an elderly user, primary contacts first
    async fn list_for_elderly(&self, elderly_id: i64) -> Result<Vec<EmergencyContact>>;
}

/// libSQL implementation of `ContactRepository`
pub struct LibSqlContactRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlContactRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_contact(row: &libsql::Row) -> Result<EmergencyContact> {
        let method: String = row.get(6)?;
        Ok(EmergencyContact {
            id: row.get(0)?,
            elderly_id: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            relationship: row.get::<Option<String>>(4)?,
            is_primary: row.get::<i32>(5)? != 0,
            notification_method: method.parse()?,
            enabled: row.get::<i32>(7)? != 0,
        })
    }
}

impl ContactRepository for LibSqlContactRepository<'_> {
    async fn insert(&self, contact: &EmergencyContact) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO emergency_contacts
                 (id, elderly_id, name, phone, relationship, is_primary, notification_method, enabled)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    contact.id.as_str(),
                    contact.elderly_id,
                    contact.name.as_str(),
                    contact.phone.as_str(),
                    contact.relationship.clone(),
                    i32::from(contact.is_primary),
                    contact.notification_method.as_str(),
                    i32::from(contact.enabled)
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_for_elderly(&self, elderly_id: i64) -> Result<Vec<EmergencyContact>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, elderly_id, name, phone, relationship, is_primary,
                        notification_method, enabled
                 FROM emergency_contacts
                 WHERE elderly_id = ? AND enabled = 1
                 ORDER BY is_primary DESC, name ASC",
                params![elderly_id],
            )
            .await?;

        let mut contacts = Vec::new();
        while let Some(row) = rows.next().await? {
            contacts.push(Self::parse_contact(&row)?);
        }
        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_list() {
        let db = setup().await;
        let repo = LibSqlContactRepository::new(db.connection());

        let mut primary = EmergencyContact::new(5, "Rahima", "+8801700000001");
        primary.is_primary = true;
        let secondary = EmergencyContact::new(5, "Karim", "+8801700000002");
        repo.insert(&secondary).await.unwrap();
        repo.insert(&primary).await.unwrap();

        let contacts = repo.list_for_elderly(5).await.unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].name, "Rahima"); // primary first
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_skips_disabled_and_other_users() {
        let db = setup().await;
        let repo = LibSqlContactRepository::new(db.connection());

        let mut disabled = EmergencyContact::new(5, "Old Number", "+8801700000003");
        disabled.enabled = false;
        repo.insert(&disabled).await.unwrap();
        repo.insert(&EmergencyContact::new(6, "Other", "+8801700000004"))
            .await
            .unwrap();

        assert!(repo.list_for_elderly(5).await.unwrap().is_empty());
    }
}

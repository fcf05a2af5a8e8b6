//! Users and their registered faces.

use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::str::FromStr;

use super::faces::{bytes_to_embedding, embedding_to_bytes};
use super::{now_timestamp, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Organizer,
    Admin,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Organizer => "organizer",
            Role::Admin => "admin",
            Role::Student => "student",
        }
    }

    /// Organizers and admins own events and may upload into them.
    pub fn is_organizer(&self) -> bool {
        matches!(self, Role::Organizer | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "organizer" => Ok(Role::Organizer),
            "admin" => Ok(Role::Admin),
            "student" => Ok(Role::Student),
            other => Err(Error::validation(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub role: Role,
}

impl Database {
    pub fn create_user(&self, name: &str, role: Role) -> Result<User> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (name, role, created_at) VALUES (?, ?, ?)",
            params![name, role.as_str(), now_timestamp()],
        )?;
        Ok(User {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            role,
        })
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, role FROM users WHERE id = ?",
                [user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, name, role)) => Ok(Some(User {
                id,
                name,
                role: role.parse()?,
            })),
            None => Ok(None),
        }
    }

    /// Store (or replace) the user's registered face.
    pub fn set_registered_face(&self, user_id: i64, embedding: &[f32]) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT OR REPLACE INTO registered_faces (user_id, embedding, embedding_dim, registered_at)
            VALUES (?, ?, ?, ?)
            "#,
            params![
                user_id,
                embedding_to_bytes(embedding),
                embedding.len() as i64,
                now_timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn get_registered_face(&self, user_id: i64) -> Result<Option<Vec<f32>>> {
        let bytes = self
            .conn()?
            .query_row(
                "SELECT embedding FROM registered_faces WHERE user_id = ?",
                [user_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(bytes.map(|b| bytes_to_embedding(&b)))
    }

    /// Returns whether a registration existed.
    pub fn delete_registered_face(&self, user_id: i64) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM registered_faces WHERE user_id = ?", [user_id])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_create_and_get_user() {
        let db = test_db();
        let user = db.create_user("Ada", Role::Organizer).unwrap();
        let loaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Ada");
        assert_eq!(loaded.role, Role::Organizer);
        assert!(db.get_user(user.id + 1).unwrap().is_none());
    }

    #[test]
    fn test_registered_face_replaced_and_removed() {
        let db = test_db();
        let user = db.create_user("Sam", Role::Student).unwrap();

        db.set_registered_face(user.id, &[1.0, 0.0]).unwrap();
        db.set_registered_face(user.id, &[0.0, 1.0]).unwrap();
        assert_eq!(db.get_registered_face(user.id).unwrap(), Some(vec![0.0, 1.0]));

        assert!(db.delete_registered_face(user.id).unwrap());
        assert!(!db.delete_registered_face(user.id).unwrap());
        assert!(db.get_registered_face(user.id).unwrap().is_none());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert!("guest".parse::<Role>().is_err());
        assert!(!Role::Student.is_organizer());
    }
}

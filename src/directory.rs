use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::UserProfile;

/// User lookup. Profiles, avatars and sign-up live outside this service.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find(&self, id: &Ulid) -> Option<UserProfile>;
}

/// Directory backed by a map, optionally seeded from a JSON array of profiles.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<Ulid, UserProfile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let users: Vec<UserProfile> = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let directory = Self::new();
        for user in users {
            directory.insert(user);
        }
        Ok(directory)
    }

    pub fn insert(&self, user: UserProfile) {
        self.users.insert(user.id, user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find(&self, id: &Ulid) -> Option<UserProfile> {
        self.users.get(id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_find() {
        let dir = InMemoryDirectory::new();
        let id = Ulid::new();
        dir.insert(UserProfile {
            id,
            name: "Dora".into(),
            email: "dora@example.com".into(),
            provider: true,
            avatar: None,
        });
        assert_eq!(dir.find(&id).await.unwrap().name, "Dora");
        assert!(dir.find(&Ulid::new()).await.is_none());
    }

    #[test]
    fn seed_from_json() {
        let path = std::env::temp_dir().join(format!("slotbook_users_{}.json", Ulid::new()));
        let id = Ulid::new();
        std::fs::write(
            &path,
            format!(r#"[{{"id":"{id}","name":"Eva","email":"eva@example.com","provider":true}}]"#),
        )
        .unwrap();

        let dir = InMemoryDirectory::from_json_file(&path).unwrap();
        assert_eq!(dir.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn seed_rejects_garbage() {
        let path = std::env::temp_dir().join(format!("slotbook_users_{}.json", Ulid::new()));
        std::fs::write(&path, "{not json").unwrap();
        let err = InMemoryDirectory::from_json_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let _ = std::fs::remove_file(&path);
    }
}

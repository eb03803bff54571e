/// 访问控制
///
/// 身份认证在外部完成，这里只做宿主机组成员检查与资源归属检查

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};

use crate::db::models::{group, group_user};
use crate::errors::Result;

/// 调用者身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: i32,
    pub is_superuser: bool,
}

impl UserContext {
    pub fn new(id: i32, is_superuser: bool) -> Self {
        Self { id, is_superuser }
    }

    /// 是否拥有属于 `owner_id` 的资源
    pub fn owns(&self, owner_id: i32) -> bool {
        self.is_superuser || self.id == owner_id
    }
}

/// 用户是否有权使用宿主机组
pub async fn group_has_user(db: &DatabaseConnection, group_id: i32, user: &UserContext) -> Result<bool> {
    if user.is_superuser {
        return Ok(true);
    }
    let found = group_user::Entity::find_by_id((group_id, user.id)).one(db).await?;
    Ok(found.is_some())
}

/// 用户在数据中心内可用的宿主机组
pub async fn user_group_ids(db: &DatabaseConnection, center_id: i32, user: &UserContext) -> Result<Vec<i32>> {
    let groups = group::Entity::find()
        .filter(group::Column::CenterId.eq(center_id))
        .filter(group::Column::Enable.eq(true))
        .all(db)
        .await?;
    let mut ids: Vec<i32> = groups.into_iter().map(|g| g.id).collect();

    if !user.is_superuser {
        let allowed: Vec<i32> = group_user::Entity::find()
            .filter(group_user::Column::UserId.eq(user.id))
            .all(db)
            .await?
            .into_iter()
            .map(|gu| gu.group_id)
            .collect();
        ids.retain(|id| allowed.contains(id));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn test_group_membership() {
        let env = TestEnv::new().await;
        let host = env.seed_host(4, 4096).await;
        let user = UserContext::new(7, false);
        let admin = UserContext::new(1, true);

        assert!(!group_has_user(&env.ctx.db, host.group_id, &user).await.unwrap());
        assert!(group_has_user(&env.ctx.db, host.group_id, &admin).await.unwrap());
        assert!(user_group_ids(&env.ctx.db, env.center.id, &user).await.unwrap().is_empty());

        env.add_group_user(host.group_id, user.id).await;
        assert!(group_has_user(&env.ctx.db, host.group_id, &user).await.unwrap());
        assert_eq!(
            user_group_ids(&env.ctx.db, env.center.id, &user).await.unwrap(),
            vec![host.group_id]
        );
        assert!(user.owns(7));
        assert!(!user.owns(8));
        assert!(admin.owns(8));
    }
}

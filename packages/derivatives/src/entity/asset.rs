use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "asset")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Serialized primary `StoredFile`, if one has been promoted.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub file_data: Option<Json>,

    /// Hex SHA-512 of the primary file. Denormalized so commits can filter on it.
    #[sea_orm(nullable)]
    pub sha512: Option<String>,

    pub lock_version: i64,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::derivative::Entity")]
    Derivative,
}

impl Related<super::derivative::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Derivative.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

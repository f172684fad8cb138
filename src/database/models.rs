use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::serialize::{self, ToSql};
use diesel::sql_types::{Integer, Text};
use diesel::sqlite::{Sqlite, SqliteValue};
use diesel::{AsExpression, Insertable, Queryable, Selectable};

use crate::database::schema;
use crate::remote::CatalogDownload;
use crate::{DownloadSourceStatus, SourceId};

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::download_sources)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    pub etag: Option<String>,
    pub status: StatusModel,
    pub download_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::download_sources)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSourceEntry {
    pub name: String,
    pub url: String,
    pub etag: Option<String>,
    pub status: StatusModel,
    pub download_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewSourceEntry {
    pub fn new(name: &str, url: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            url: url.to_string(),
            etag: None,
            status: DownloadSourceStatus::default().into(),
            download_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::downloads)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadEntry {
    pub id: i32,
    pub source_id: SourceId,
    pub title: String,
    pub uris: UrisModel,
    pub file_size: Option<String>,
    pub upload_date: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::downloads)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDownloadEntry {
    pub source_id: SourceId,
    pub title: String,
    pub uris: UrisModel,
    pub file_size: Option<String>,
    pub upload_date: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewDownloadEntry {
    pub fn from_catalog(source_id: SourceId, download: &CatalogDownload) -> Self {
        Self {
            source_id,
            title: download.title.clone(),
            uris: UrisModel(download.uris.clone()),
            file_size: download.file_size.clone(),
            upload_date: download.upload_date.clone(),
            created_at: Utc::now(),
        }
    }
}

/// SQLite wrapper for list of download URIs, providing its serialization through [`serde_json`].
#[derive(Debug, Clone, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = Text)]
pub struct UrisModel(pub Vec<String>);

impl From<UrisModel> for Vec<String> {
    fn from(value: UrisModel) -> Self {
        value.0
    }
}

impl FromSql<Text, Sqlite> for UrisModel {
    fn from_sql(mut bytes: SqliteValue) -> deserialize::Result<Self> {
        Ok(Self(serde_json::from_str(bytes.read_text())?))
    }
}

impl ToSql<Text, Sqlite> for UrisModel {
    fn to_sql<'b>(&'b self, out: &mut serialize::Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(serde_json::to_string(&self.0)?);
        Ok(serialize::IsNull::No)
    }
}

/// SQLite wrapper for [`DownloadSourceStatus`], providing its serialization through integer conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = Integer)]
pub struct StatusModel(pub DownloadSourceStatus);

impl ToSql<Integer, Sqlite> for StatusModel {
    fn to_sql<'b>(&'b self, out: &mut serialize::Output<'b, '_, Sqlite>) -> serialize::Result {
        match self.0 {
            DownloadSourceStatus::UpToDate => <i32 as ToSql<Integer, Sqlite>>::to_sql(&0, out),
            DownloadSourceStatus::Errored => <i32 as ToSql<Integer, Sqlite>>::to_sql(&1, out),
            DownloadSourceStatus::Pending => <i32 as ToSql<Integer, Sqlite>>::to_sql(&2, out),
        }
    }
}

impl FromSql<Integer, Sqlite> for StatusModel
where
    i32: FromSql<Integer, Sqlite>,
{
    fn from_sql(bytes: SqliteValue) -> deserialize::Result<Self> {
        match i32::from_sql(bytes)? {
            0 => Ok(Self(DownloadSourceStatus::UpToDate)),
            1 => Ok(Self(DownloadSourceStatus::Errored)),
            2 => Ok(Self(DownloadSourceStatus::Pending)),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl From<DownloadSourceStatus> for StatusModel {
    fn from(value: DownloadSourceStatus) -> Self {
        Self(value)
    }
}

impl From<StatusModel> for DownloadSourceStatus {
    fn from(value: StatusModel) -> Self {
        value.0
    }
}

impl PartialEq<DownloadSourceStatus> for StatusModel {
    fn eq(&self, other: &DownloadSourceStatus) -> bool {
        self.0.eq(other)
    }
}

impl PartialEq<StatusModel> for DownloadSourceStatus {
    fn eq(&self, other: &StatusModel) -> bool {
        self.eq(&other.0)
    }
}

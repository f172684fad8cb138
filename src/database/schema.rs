diesel::table! {
    /// Configured download sources.
    download_sources (id) {
        /// Primary key. Never reused (`AUTOINCREMENT`).
        id -> Integer,

        /// Display name, taken from the source catalog.
        name -> VarChar,

        // Manually added UNIQUE to up.sql, because diesel can't do that
        /// URL of the source catalog.
        url -> VarChar,

        /// Entity tag of the last fetched catalog.
        etag -> Nullable<VarChar>,

        /// Result of the last synchronization.
        status -> Integer,

        /// Number of downloads provided by the source.
        download_count -> Integer,

        /// Entry creation timestamp.
        created_at -> TimestamptzSqlite,

        /// Timestamp of the last synchronization which touched the entry.
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    /// Downloads listed by source catalogs.
    downloads (id) {
        /// Primary key.
        id -> Integer,

        /// Owning source. Rows are deleted together with the source.
        source_id -> Integer,

        /// Title of the download.
        title -> VarChar,

        /// JSON array of URIs.
        uris -> Text,

        file_size -> Nullable<VarChar>,

        upload_date -> Nullable<VarChar>,

        created_at -> TimestamptzSqlite,
    }
}

diesel::joinable!(downloads -> download_sources (source_id));
diesel::allow_tables_to_appear_in_same_query!(download_sources, downloads);

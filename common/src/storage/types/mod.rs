use serde::{Deserialize, Serialize};
pub mod download_queue_item;
pub mod extracted_document;
pub mod task;

pub trait StoredObject: Serialize + for<'de> Deserialize<'de> {
    fn table_name() -> &'static str;
    fn get_id(&self) -> &str;
}

/// (De)serializers shared by every stored row. SurrealDB hands record ids back
/// as `Thing`s and timestamps as its own `Datetime`, so rows go through these.
pub mod serde_helpers {
    use std::fmt;

    use chrono::{DateTime, Utc};
    use serde::{
        de::{self, Visitor},
        Deserialize, Deserializer, Serialize, Serializer,
    };
    use surrealdb::sql::{Datetime as SurrealDatetime, Thing};

    struct FlexibleIdVisitor;

    impl<'de> Visitor<'de> for FlexibleIdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a Thing")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
            Ok(thing.id.to_raw())
        }
    }

    pub fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(FlexibleIdVisitor)
    }

    pub fn serialize_datetime<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SurrealDatetime::from(*date).serialize(serializer)
    }

    pub fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let dt = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::<Utc>::from(dt))
    }

    pub fn serialize_option_datetime<S>(
        date: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(dt) => serializer.serialize_some(&SurrealDatetime::from(*dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize_option_datetime<'de, D>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(value.map(DateTime::<Utc>::from))
    }
}

/// Declares a row struct with `id`, `created_at` and `updated_at` plus the
/// listed fields, and implements [`StoredObject`] for it.
#[macro_export]
macro_rules! stored_object {
    ($name:ident, $table:expr, {$($(#[$attr:meta])* $field:ident: $ty:ty),*}) => {
        use serde::{Deserialize, Serialize};
        use $crate::storage::types::StoredObject;
        use chrono::{DateTime, Utc};

        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        pub struct $name {
            #[serde(deserialize_with = "crate::storage::types::serde_helpers::deserialize_flexible_id")]
            pub id: String,
            #[serde(
                serialize_with = "crate::storage::types::serde_helpers::serialize_datetime",
                deserialize_with = "crate::storage::types::serde_helpers::deserialize_datetime",
                default
            )]
            pub created_at: DateTime<Utc>,
            #[serde(
                serialize_with = "crate::storage::types::serde_helpers::serialize_datetime",
                deserialize_with = "crate::storage::types::serde_helpers::deserialize_datetime",
                default
            )]
            pub updated_at: DateTime<Utc>,
            $( $(#[$attr])* pub $field: $ty),*
        }

        impl StoredObject for $name {
            fn table_name() -> &'static str {
                $table
            }

            fn get_id(&self) -> &str {
                &self.id
            }
        }
    };
}

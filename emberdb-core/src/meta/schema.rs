//! Metric schemas

use crate::types::{FieldId, FieldMeta, FieldType, MetricId, TagKeyId};
use crate::{EmberError, Result};
use serde::{Deserialize, Serialize};

/// One tag key of a metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagKeyMeta {
    pub id: TagKeyId,
    pub name: String,
}

/// Schema of one metric: its fields and tag keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSchema {
    pub metric_id: MetricId,
    pub fields: Vec<FieldMeta>,
    pub tag_keys: Vec<TagKeyMeta>,
}

impl MetricSchema {
    /// Schema for a fresh metric
    pub fn new(metric_id: MetricId) -> Self {
        Self {
            metric_id,
            ..Default::default()
        }
    }

    /// Field by name
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Field by id
    pub fn field_by_id(&self, field_id: FieldId) -> Option<&FieldMeta> {
        self.fields.iter().find(|field| field.id == field_id)
    }

    /// Tag key by name
    pub fn tag_key(&self, name: &str) -> Option<&TagKeyMeta> {
        self.tag_keys.iter().find(|tag| tag.name == name)
    }

    /// Get or allocate a field id; ids stay dense in `[0, n)`
    pub fn ensure_field(
        &mut self,
        name: &str,
        field_type: FieldType,
        max_fields: usize,
    ) -> Result<FieldId> {
        if let Some(field) = self.field(name) {
            if field.field_type != field_type {
                return Err(EmberError::InvalidFormat(format!(
                    "field {} written as {:?} but declared {:?}",
                    name, field_type, field.field_type
                )));
            }
            return Ok(field.id);
        }
        if max_fields > 0 && self.fields.len() >= max_fields {
            return Err(EmberError::TooManyFields { max: max_fields });
        }
        if self.fields.len() > FieldId::MAX as usize {
            return Err(EmberError::TooManyFields {
                max: FieldId::MAX as usize + 1,
            });
        }
        let id = self.fields.len() as FieldId;
        self.fields.push(FieldMeta {
            id,
            field_type,
            name: name.to_string(),
        });
        Ok(id)
    }

    /// Serialise the schema
    pub fn marshal(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EmberError::InvalidFormat(e.to_string()))
    }

    /// Parse a serialised schema
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| EmberError::InvalidFormat(e.to_string()))
    }
}

/// Histogram bucket fields follow this naming scheme
pub const HISTOGRAM_BUCKET_PREFIX: &str = "__bucket_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_ids_dense_and_stable() {
        let mut schema = MetricSchema::new(1);
        assert_eq!(schema.ensure_field("a", FieldType::Sum, 0).unwrap(), 0);
        assert_eq!(schema.ensure_field("b", FieldType::Gauge, 0).unwrap(), 1);
        // repeat allocation returns the existing id
        assert_eq!(schema.ensure_field("a", FieldType::Sum, 0).unwrap(), 0);

        let data = schema.marshal().unwrap();
        let parsed = MetricSchema::unmarshal(&data).unwrap();
        assert_eq!(parsed, schema);
    }

    #[test]
    fn test_field_type_conflict() {
        let mut schema = MetricSchema::new(1);
        schema.ensure_field("a", FieldType::Sum, 0).unwrap();
        assert!(schema.ensure_field("a", FieldType::Gauge, 0).is_err());
    }

    #[test]
    fn test_field_limit() {
        let mut schema = MetricSchema::new(1);
        schema.ensure_field("a", FieldType::Sum, 2).unwrap();
        schema.ensure_field("b", FieldType::Sum, 2).unwrap();
        assert!(matches!(
            schema.ensure_field("c", FieldType::Sum, 2),
            Err(EmberError::TooManyFields { max: 2 })
        ));
    }
}

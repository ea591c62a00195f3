//! Field templates and the positional alignment of data records to template fields

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MeterConfig;
use crate::mbus::{DataRecord, DecodedFrame};

/// How to name and publish the data record at one position of a telegram
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
pub struct FieldDescriptor {
    #[serde(default)]
    pub publish: bool,
    pub name: String,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub unit: String,
}

#[derive(Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error("Template {0} is not defined")]
    UnknownTemplate(String),
    #[error("Meter {meter} references undefined template {template}")]
    UnresolvedMeter { meter: String, template: String },
}

/// Named field templates, read only after the configuration is loaded
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Vec<FieldDescriptor>>,
}

impl TemplateRegistry {
    pub fn new(templates: BTreeMap<String, Vec<FieldDescriptor>>) -> Self {
        return TemplateRegistry { templates };
    }

    /// Returns the fields of a template in configured order
    pub fn resolve(&self, template: &str) -> Result<&[FieldDescriptor], TemplateError> {
        return self
            .templates
            .get(template)
            .map(|fields| fields.as_slice())
            .ok_or_else(|| TemplateError::UnknownTemplate(template.to_string()));
    }

    /// Fails on the first meter whose template is not defined
    pub fn validate(&self, meters: &[MeterConfig]) -> Result<(), TemplateError> {
        for meter in meters {
            if !self.templates.contains_key(&meter.template) {
                return Err(TemplateError::UnresolvedMeter {
                    meter: meter.name.clone(),
                    template: meter.template.clone(),
                });
            }
        }
        return Ok(());
    }

    /// Sensor names used twice within one template, as (template, sensor) pairs
    pub fn duplicate_names(&self) -> Vec<(String, String)> {
        let mut duplicates = Vec::new();
        for (template, fields) in self.templates.iter() {
            let mut seen = HashSet::new();
            for field in fields {
                if !seen.insert(field.name.as_str()) {
                    duplicates.push((template.clone(), field.name.clone()));
                }
            }
        }
        return duplicates;
    }

    pub fn resolve_meter<'a>(&'a self, meter: &MeterConfig, frame: &'a DecodedFrame) -> Result<Resolution<'a>, TemplateError> {
        let fields = self.resolve(&meter.template)?;
        return Ok(resolve_fields(fields, frame));
    }
}

/// A data record paired with the field descriptor at the same position
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField<'a> {
    pub index: usize,
    pub record: &'a DataRecord,
    pub field: &'a FieldDescriptor,
}

impl ResolvedField<'_> {
    pub fn is_eligible(&self) -> bool {
        return self.field.publish;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    pub fields: Vec<ResolvedField<'a>>,
    /// Records past the end of the template
    pub unmapped_records: usize,
    /// Template fields the device sent no record for
    pub unused_descriptors: usize,
}

impl<'a> Resolution<'a> {
    /// Pairs to publish, in record order
    pub fn eligible(&self) -> impl Iterator<Item = &ResolvedField<'a>> {
        return self.fields.iter().filter(|f| f.is_eligible());
    }

    pub fn is_aligned(&self) -> bool {
        return self.unmapped_records == 0 && self.unused_descriptors == 0;
    }
}

/// Pairs records and descriptors by position up to the shorter of both lists
pub fn resolve_fields<'a>(fields: &'a [FieldDescriptor], frame: &'a DecodedFrame) -> Resolution<'a> {
    let records = &frame.data_records;

    return Resolution {
        fields: records
            .iter()
            .zip(fields.iter())
            .enumerate()
            .map(|(index, (record, field))| ResolvedField { index, record, field })
            .collect(),
        unmapped_records: records.len().saturating_sub(fields.len()),
        unused_descriptors: fields.len().saturating_sub(records.len()),
    };
}

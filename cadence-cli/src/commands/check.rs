//! Static checks over a manifest, without running anything.

use crate::manifest::{Manifest, Step};
use anyhow::{bail, Context, Result};
use cadence_runtime::{JsonSchemaRegistry, MachineDefinition, Severity};
use cadence_types::{ActorId, ConfigKind, Map, Value};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub subject: String,
    pub message: String,
}

#[derive(Serialize)]
struct CheckSummary<'a> {
    actors: usize,
    documents: usize,
    errors: usize,
    warnings: usize,
    findings: &'a [Finding],
}

#[derive(Default)]
struct Findings(Vec<Finding>);

impl Findings {
    fn error(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Error, subject, message);
    }

    fn warning(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Warning, subject, message);
    }

    fn push(&mut self, severity: Severity, subject: impl Into<String>, message: impl Into<String>) {
        self.0.push(Finding {
            severity,
            subject: subject.into(),
            message: message.into(),
        });
    }

    fn count(&self, severity: Severity) -> usize {
        self.0.iter().filter(|f| f.severity == severity).count()
    }
}

/// Message types an actor will accept once its interface is applied
fn effective_accepts(
    spec_accepts: &BTreeSet<String>,
    interface: Option<&Map>,
) -> BTreeSet<String> {
    match interface
        .and_then(|doc| doc.get("accepts"))
        .and_then(Value::as_array)
    {
        Some(accepts) => accepts
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => spec_accepts.clone(),
    }
}

/// Check every actor of a manifest against its documents and schemas
pub fn check_manifest_findings(manifest: &Manifest) -> Result<(Vec<Finding>, usize)> {
    let mut findings = Findings::default();

    if let Err(err) = manifest.runtime.validate() {
        findings.error("runtime", err.to_string());
    }

    let documents = manifest.documents()?;
    let registry = JsonSchemaRegistry::new();
    for (kind, schema) in manifest.schemas()? {
        if let Err(err) = registry.register(kind.clone(), schema) {
            findings.error(format!("schema '{}'", kind), err.to_string());
        }
    }
    let schema_kinds: BTreeSet<String> = registry.kinds().into_iter().collect();

    let mut accepted: BTreeMap<ActorId, BTreeSet<String>> = BTreeMap::new();
    for spec in &manifest.actors {
        let subject = format!("actor '{}'", spec.id);
        if accepted.contains_key(&spec.id) {
            findings.error(&subject, "declared more than once");
            continue;
        }

        let config_doc = manifest.config_document(spec);
        let config = documents.get(&config_doc);
        if config.is_none() && spec.config.is_some() {
            findings.warning(&subject, format!("configuration document '{}' is not seeded", config_doc));
        }

        let reference =
            |kind: ConfigKind| config.and_then(|c| c.get(kind.as_str())).and_then(Value::as_str);
        for kind in ConfigKind::ALL {
            if kind == ConfigKind::Context {
                continue;
            }
            if let Some(doc) = reference(kind) {
                if !documents.contains_key(doc) {
                    findings.warning(
                        &subject,
                        format!("{} reference '{}' is not seeded", kind, doc),
                    );
                }
            }
        }

        let accepts = effective_accepts(
            &spec.accepts,
            reference(ConfigKind::Interface).and_then(|doc| documents.get(doc)),
        );
        for kind in &accepts {
            if !schema_kinds.contains(kind) {
                findings.error(&subject, format!("accepts '{}' but no schema is registered", kind));
            }
        }

        if let Some(machine_doc) = reference(ConfigKind::State).and_then(|doc| documents.get(doc)) {
            match MachineDefinition::from_value(&Value::Object(machine_doc.clone())) {
                Ok(definition) => {
                    let events: BTreeSet<&str> = definition
                        .state_names()
                        .flat_map(|state| definition.events(state))
                        .collect();
                    for event in events {
                        if !accepts.contains(event) {
                            findings.warning(
                                &subject,
                                format!("handles '{}' which it never accepts", event),
                            );
                        }
                    }
                }
                Err(err) => findings.error(&subject, format!("invalid state machine: {}", err)),
            }
        }

        if let Some(children) = config.and_then(|c| c.get("children")).and_then(Value::as_object) {
            let declared: BTreeSet<&str> = manifest.actors.iter().map(|a| a.id.as_str()).collect();
            for (name, child) in children {
                match child.as_str() {
                    Some(id) if declared.contains(id) => {}
                    _ => findings.warning(
                        &subject,
                        format!("child '{}' is not a declared actor", name),
                    ),
                }
            }
        }

        accepted.insert(spec.id.clone(), accepts);
    }

    for (index, step) in manifest.script.iter().enumerate() {
        let Step::Send(send) = step else {
            continue;
        };
        let subject = format!("step {}", index + 1);
        match accepted.get(&send.to) {
            None => findings.error(&subject, format!("sends to undeclared actor '{}'", send.to)),
            Some(accepts) if !accepts.contains(&send.kind) => findings.warning(
                &subject,
                format!("'{}' does not accept '{}'", send.to, send.kind),
            ),
            Some(_) => {}
        }
    }

    Ok((findings.0, documents.len()))
}

/// Print findings and fail if any is an error
pub fn check_manifest(path: &Path, json: bool) -> Result<()> {
    let manifest = Manifest::from_file(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    let (findings, documents) = check_manifest_findings(&manifest)?;
    let findings = Findings(findings);
    let errors = findings.count(Severity::Error);
    let warnings = findings.count(Severity::Warning);

    if json {
        let summary = CheckSummary {
            actors: manifest.actors.len(),
            documents,
            errors,
            warnings,
            findings: &findings.0,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Checked {} actors, {} documents: {} errors, {} warnings",
            manifest.actors.len(),
            documents,
            errors,
            warnings
        );
        for finding in &findings.0 {
            println!("- {} {}: {}", finding.severity, finding.subject, finding.message);
        }
    }

    if errors > 0 {
        bail!("manifest has {} error(s)", errors);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings(yaml: &str) -> Vec<Finding> {
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        check_manifest_findings(&manifest).unwrap().0
    }

    #[test]
    fn test_clean_manifest() {
        let found = findings(
            r#"
documents:
  machines/c:
    initial: idle
    states:
      idle:
        on: { INC: idle }
  config/c: { state: machines/c }
schemas:
  INC: { type: object }
actors:
  - id: c
    accepts: [INC]
script:
  - send: { to: c, type: INC, payload: {} }
"#,
        );
        assert!(found.is_empty(), "{:?}", found);
    }

    #[test]
    fn test_reports_missing_schema_and_bad_machine() {
        let found = findings(
            r#"
documents:
  machines/c: { initial: nowhere, states: {} }
  config/c: { state: machines/c }
actors:
  - id: c
    accepts: [INC]
"#,
        );
        let errors: Vec<&Finding> = found
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|f| f.message.contains("no schema")));
        assert!(errors.iter().any(|f| f.message.contains("invalid state machine")));
    }

    #[test]
    fn test_interface_overrides_spec_accepts() {
        let found = findings(
            r#"
documents:
  interfaces/c: { accepts: [PING] }
  config/c: { interface: interfaces/c }
schemas:
  PING: {}
actors:
  - id: c
    accepts: [INC]
script:
  - send: { to: c, type: INC }
  - send: { to: ghost, type: PING }
"#,
        );
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].severity, Severity::Warning);
        assert_eq!(found[0].subject, "step 1");
        assert_eq!(found[1].severity, Severity::Error);
        assert!(found[1].message.contains("undeclared actor 'ghost'"));
    }
}

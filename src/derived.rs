//! Derived Attribute Resolver
//!
//! Derived attributes are computed from other attributes after every read.
//! Two kinds exist: `compile` gathers values into a nested list of a fixed
//! shape, and `computed` is a product of powers plus linear terms, scaled,
//! rounded and optionally clamped. Dependencies may be derived themselves;
//! the table is evaluated in topological order, so a cycle is a load error.

use crate::batch::RequestItem;
use crate::codec::round_to;
use crate::error::{FieldgateError, Result};
use crate::logging::get_logger;
use crate::registers::DeviceModel;
use crate::value::{AttributeValues, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

fn default_scale() -> f64 {
    1.0
}

/// One `derived:` entry of a model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<ShapeTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedSpec>,
}

/// Nested list template as written in YAML. Strings name attributes; any
/// other scalar is a placeholder that stays null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeTemplate {
    Group(Vec<ShapeTemplate>),
    Name(String),
    Placeholder(Option<f64>),
}

/// Resolved shape tree
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeNode {
    Leaf(Option<String>),
    Group(Vec<ShapeNode>),
}

impl ShapeNode {
    /// Copy current values into a container of the same shape
    pub fn materialize(&self, values: &AttributeValues) -> Value {
        match self {
            ShapeNode::Leaf(Some(name)) => values.get(name).cloned().unwrap_or(Value::Null),
            ShapeNode::Leaf(None) => Value::Null,
            ShapeNode::Group(children) => {
                Value::List(children.iter().map(|c| c.materialize(values)).collect())
            }
        }
    }

    fn leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ShapeNode::Leaf(Some(name)) => out.push(name),
            ShapeNode::Leaf(None) => {}
            ShapeNode::Group(children) => children.iter().for_each(|c| c.leaves(out)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowerClamp {
    pub threshold: f64,
    pub replacement: f64,
}

/// `computed:` parameters. Dependencies are `[factor, attribute]` pairs: the
/// factor is an exponent for scale dependencies and a coefficient for bias
/// dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedSpec {
    #[serde(default)]
    pub scale_dependencies: Vec<(f64, String)>,

    #[serde(default)]
    pub bias_dependencies: Vec<(f64, String)>,

    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub bias: f64,

    #[serde(default)]
    pub precision: u32,

    #[serde(default)]
    pub lower_clamp: Option<LowerClamp>,
}

impl ComputedSpec {
    /// Evaluate against current values. Any null or non-numeric dependency
    /// makes the result null.
    pub fn evaluate(&self, values: &AttributeValues) -> Option<f64> {
        let numeric = |name: &str| values.get(name).and_then(Value::as_f64);

        let mut acc = 1.0;
        for (exponent, dep) in &self.scale_dependencies {
            let v = numeric(dep)?;
            if v == 0.0 {
                acc = 0.0;
            } else {
                acc *= v.powf(*exponent);
            }
        }
        for (coefficient, dep) in &self.bias_dependencies {
            acc += coefficient * numeric(dep)?;
        }

        let mut result = round_to(acc * self.scale + self.bias, self.precision);
        if let Some(clamp) = self.lower_clamp
            && result < clamp.threshold
        {
            result = clamp.replacement;
        }
        result.is_finite().then_some(result)
    }

    fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.scale_dependencies
            .iter()
            .chain(self.bias_dependencies.iter())
            .map(|(_, name)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedSpec {
    Compile(ShapeNode),
    Computed(ComputedSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedAttribute {
    pub name: String,
    pub spec: DerivedSpec,
    /// Raw attributes this entry needs, transitively
    raw_dependencies: Vec<String>,
}

/// Derived attributes of one model, in evaluation order
#[derive(Debug, Clone, Default)]
pub struct DerivedTable {
    ordered: Vec<DerivedAttribute>,
    index: HashMap<String, usize>,
}

enum DepRef {
    Raw(String),
    Derived(usize),
    Missing,
}

impl DerivedTable {
    /// Validate the entries against the model and order them so every
    /// dependency is evaluated before its dependents.
    pub fn new(model: &DeviceModel, entries: &[DerivedEntry]) -> Result<Self> {
        let logger = get_logger("derived");
        let field = format!("models.{}.derived", model.name());

        let mut declared = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if model.lookup_name(&entry.name).is_some() {
                return Err(FieldgateError::validation(
                    field.as_str(),
                    format!("'{}' shadows a register attribute", entry.name),
                ));
            }
            if declared.insert(entry.name.to_ascii_lowercase(), i).is_some() {
                return Err(FieldgateError::validation(
                    field.as_str(),
                    format!("'{}' is declared twice", entry.name),
                ));
            }
        }

        let lookup = |name: &str| -> DepRef {
            if let Some(&i) = declared.get(&name.to_ascii_lowercase()) {
                DepRef::Derived(i)
            } else if let Some(spec) = model.lookup_name(name) {
                DepRef::Raw(spec.name.clone())
            } else {
                DepRef::Missing
            }
        };
        let canonical = |dep: &DepRef, original: &str| -> String {
            match dep {
                DepRef::Raw(name) => name.clone(),
                DepRef::Derived(i) => entries[*i].name.clone(),
                DepRef::Missing => original.to_string(),
            }
        };

        // Resolve each entry and collect its derived dependencies
        let mut specs = Vec::with_capacity(entries.len());
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
        let mut direct_raw: Vec<Vec<String>> = vec![Vec::new(); entries.len()];
        for (i, entry) in entries.iter().enumerate() {
            let spec = match (&entry.compile, &entry.computed) {
                (Some(template), None) => {
                    let mut missing = Vec::new();
                    let shape = resolve_template(template, &lookup, &canonical, &mut missing);
                    for name in missing {
                        logger.warn(&format!(
                            "Model '{}': compile '{}' names unknown attribute '{}'; it stays null",
                            model.name(),
                            entry.name,
                            name
                        ));
                    }
                    DerivedSpec::Compile(shape)
                }
                (None, Some(computed)) => {
                    let mut resolved = computed.clone();
                    for (_, dep) in resolved
                        .scale_dependencies
                        .iter_mut()
                        .chain(resolved.bias_dependencies.iter_mut())
                    {
                        let r = lookup(dep);
                        if matches!(r, DepRef::Missing) {
                            return Err(FieldgateError::validation(
                                field.as_str(),
                                format!("'{}' depends on unknown attribute '{}'", entry.name, dep),
                            ));
                        }
                        *dep = canonical(&r, dep);
                    }
                    DerivedSpec::Computed(resolved)
                }
                _ => {
                    return Err(FieldgateError::validation(
                        field.as_str(),
                        format!("'{}' needs exactly one of compile or computed", entry.name),
                    ));
                }
            };

            let mut dep_names: Vec<&str> = Vec::new();
            match &spec {
                DerivedSpec::Compile(shape) => shape.leaves(&mut dep_names),
                DerivedSpec::Computed(c) => dep_names.extend(c.dependencies()),
            }
            for dep in dep_names {
                match lookup(dep) {
                    DepRef::Derived(j) => {
                        if !edges[j].contains(&i) {
                            edges[j].push(i);
                        }
                    }
                    DepRef::Raw(name) => {
                        if !direct_raw[i].contains(&name) {
                            direct_raw[i].push(name);
                        }
                    }
                    DepRef::Missing => {}
                }
            }
            specs.push(spec);
        }

        let order = topological_order(&edges).ok_or_else(|| {
            FieldgateError::validation(field.as_str(), "derived attributes form a cycle")
        })?;

        // Transitive raw dependencies, accumulated in evaluation order
        let mut raw: Vec<Vec<String>> = direct_raw.clone();
        for &i in &order {
            for &dependent in &edges[i] {
                let inherited = raw[i].clone();
                for name in inherited {
                    if !raw[dependent].contains(&name) {
                        raw[dependent].push(name);
                    }
                }
            }
        }

        let mut table = Self::default();
        for i in order {
            table
                .index
                .insert(entries[i].name.to_ascii_lowercase(), table.ordered.len());
            table.ordered.push(DerivedAttribute {
                name: entries[i].name.clone(),
                spec: specs[i].clone(),
                raw_dependencies: std::mem::take(&mut raw[i]),
            });
        }
        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Entries in evaluation order
    pub fn entries(&self) -> &[DerivedAttribute] {
        &self.ordered
    }

    pub fn get(&self, name: &str) -> Option<&DerivedAttribute> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.ordered[i])
    }

    /// Replace derived names by the raw attributes they need. Other items
    /// pass through; duplicates are removed, keeping first occurrence.
    pub fn expand_read_items(&self, items: &[RequestItem]) -> Vec<RequestItem> {
        let mut out = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        let mut push = |item: RequestItem, out: &mut Vec<RequestItem>| {
            let key = match &item {
                RequestItem::Name(n) => n.to_ascii_lowercase(),
                RequestItem::Address(a) => format!("#{}", a),
            };
            if seen.insert(key) {
                out.push(item);
            }
        };
        for item in items {
            match item {
                RequestItem::Name(name) => match self.get(name) {
                    Some(derived) => {
                        for dep in &derived.raw_dependencies {
                            push(RequestItem::Name(dep.clone()), &mut out);
                        }
                    }
                    None => push(item.clone(), &mut out),
                },
                RequestItem::Address(_) => push(item.clone(), &mut out),
            }
        }
        out
    }

    /// Compute every derived attribute in dependency order
    pub fn evaluate(&self, values: &mut AttributeValues) {
        for entry in &self.ordered {
            let value = match &entry.spec {
                DerivedSpec::Compile(shape) => shape.materialize(values),
                DerivedSpec::Computed(spec) => Value::from(spec.evaluate(values)),
            };
            values.insert(entry.name.clone(), value);
        }
    }
}

fn resolve_template(
    template: &ShapeTemplate,
    lookup: &dyn Fn(&str) -> DepRef,
    canonical: &dyn Fn(&DepRef, &str) -> String,
    missing: &mut Vec<String>,
) -> ShapeNode {
    match template {
        ShapeTemplate::Group(children) => ShapeNode::Group(
            children
                .iter()
                .map(|c| resolve_template(c, lookup, canonical, missing))
                .collect(),
        ),
        ShapeTemplate::Name(name) => {
            let dep = lookup(name);
            if matches!(dep, DepRef::Missing) {
                missing.push(name.clone());
            }
            ShapeNode::Leaf(Some(canonical(&dep, name)))
        }
        ShapeTemplate::Placeholder(_) => ShapeNode::Leaf(None),
    }
}

/// Kahn's algorithm, preferring declaration order among ready nodes
fn topological_order(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut indegree = vec![0usize; edges.len()];
    for targets in edges {
        for &t in targets {
            indegree[t] += 1;
        }
    }
    let mut ready: VecDeque<usize> = (0..edges.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &t in &edges[i] {
            indegree[t] -= 1;
            if indegree[t] == 0 {
                ready.push_back(t);
            }
        }
    }
    (order.len() == edges.len()).then_some(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::DeviceProfile;

    const INVERTER: &str = r#"
name: inverter
attributes:
  - { name: Output_Current, read: 3, address: 0x0026, scale: 0.01, precision: 2 }
  - { name: Output_Voltage, read: 3, address: 0x0027, scale: 0.1, precision: 1 }
  - { name: DC_Bus_Voltage, read: 3, address: 0x0031, precision: 0 }
derived:
  - name: DC_Current
    computed:
      scale: -0.158
      bias: -17.81
      precision: 2
      lower_clamp: { threshold: 0.3, replacement: 0 }
      scale_dependencies: [[2, DC_Current_raw]]
      bias_dependencies: [[-27.658, DC_Current_raw]]
  - name: DC_Current_raw
    computed:
      scale: 1.5762
      precision: 3
      scale_dependencies: [[1, Output_Current], [1, Output_Voltage], [-1, DC_Bus_Voltage]]
  - name: Phase_Snapshot
    compile: [[Output_Current, Output_Voltage], [null, Missing_One]]
"#;

    fn values(pairs: &[(&str, Value)]) -> AttributeValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_dependencies_evaluated_first() {
        let profile = DeviceProfile::from_yaml_str(INVERTER).unwrap();
        let order: Vec<&str> = profile
            .derived
            .entries()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        let raw_pos = order.iter().position(|n| *n == "DC_Current_raw").unwrap();
        let cur_pos = order.iter().position(|n| *n == "DC_Current").unwrap();
        assert!(raw_pos < cur_pos);
    }

    #[test]
    fn test_expand_read_items_is_transitive() {
        let profile = DeviceProfile::from_yaml_str(INVERTER).unwrap();
        let expanded = profile
            .derived
            .expand_read_items(&["DC_Current".into(), "Output_Current".into()]);
        assert_eq!(
            expanded,
            vec![
                RequestItem::from("Output_Current"),
                RequestItem::from("Output_Voltage"),
                RequestItem::from("DC_Bus_Voltage"),
            ]
        );
    }

    #[test]
    fn test_null_propagates() {
        let profile = DeviceProfile::from_yaml_str(INVERTER).unwrap();
        let mut v = values(&[
            ("Output_Current", Value::Number(10.0)),
            ("Output_Voltage", Value::Null),
            ("DC_Bus_Voltage", Value::Number(300.0)),
        ]);
        profile.derived.evaluate(&mut v);
        assert_eq!(v["DC_Current_raw"], Value::Null);
        assert_eq!(v["DC_Current"], Value::Null);
    }

    #[test]
    fn test_zero_dependency_short_circuits_product() {
        let spec = ComputedSpec {
            scale_dependencies: vec![(1.0, "a".into()), (-1.0, "b".into())],
            bias_dependencies: vec![],
            scale: 2.0,
            bias: 1.0,
            precision: 1,
            lower_clamp: None,
        };
        let v = values(&[("a", Value::Number(0.0)), ("b", Value::Number(0.0))]);
        assert_eq!(spec.evaluate(&v), Some(1.0));
    }

    #[test]
    fn test_lower_clamp() {
        let spec = ComputedSpec {
            scale_dependencies: vec![(1.0, "a".into())],
            bias_dependencies: vec![],
            scale: 1.0,
            bias: 0.0,
            precision: 2,
            lower_clamp: Some(LowerClamp {
                threshold: 0.3,
                replacement: 0.0,
            }),
        };
        assert_eq!(spec.evaluate(&values(&[("a", Value::Number(0.25))])), Some(0.0));
        assert_eq!(spec.evaluate(&values(&[("a", Value::Number(-4.0))])), Some(0.0));
        assert_eq!(spec.evaluate(&values(&[("a", Value::Number(5.0))])), Some(5.0));
    }

    #[test]
    fn test_compile_shape_and_placeholders() {
        let profile = DeviceProfile::from_yaml_str(INVERTER).unwrap();
        let mut v = values(&[
            ("Output_Current", Value::Number(1.5)),
            ("Output_Voltage", Value::Number(200.0)),
        ]);
        profile.derived.evaluate(&mut v);
        assert_eq!(
            v["Phase_Snapshot"],
            Value::List(vec![
                Value::List(vec![Value::Number(1.5), Value::Number(200.0)]),
                Value::List(vec![Value::Null, Value::Null]),
            ])
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
name: loop
attributes:
  - { name: A, read: 3, address: 1 }
derived:
  - { name: X, computed: { scale_dependencies: [[1, Y]] } }
  - { name: Y, computed: { scale_dependencies: [[1, X]] } }
"#;
        let err = DeviceProfile::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_computed_dependency_rejected() {
        let yaml = r#"
name: bad
attributes:
  - { name: A, read: 3, address: 1 }
derived:
  - { name: X, computed: { scale_dependencies: [[1, Nope]] } }
"#;
        assert!(DeviceProfile::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_shadowing_rejected() {
        let yaml = r#"
name: bad
attributes:
  - { name: A, read: 3, address: 1 }
derived:
  - { name: a, compile: [A] }
"#;
        assert!(DeviceProfile::from_yaml_str(yaml).is_err());
    }
}

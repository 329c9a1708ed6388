// src/aggregation.rs
// Aggregation pipeline implementation

use indexmap::IndexMap;

use crate::document::{Document, ID_FIELD};
use crate::error::{codes, Result, ShadowDbError};
use crate::expression::{Evaluated, Expr};
use crate::find_options::{apply_sort, parse_sort};
use crate::path;
use crate::projection::Projection;
use crate::query::{is_operator_document, matches_filter, Query};
use crate::value::{Number, Value};
use crate::log_debug;

// ============================================================================
// PIPELINE CONTEXT
// ============================================================================

/// Collection access needed by `$lookup` and `$out`
///
/// The store implements this; stages never hold on to collections between
/// invocations.
pub trait PipelineContext {
    /// Snapshot of a collection's documents in natural order; empty when absent
    fn documents(&self, collection: &str) -> Vec<Document>;

    /// Replace the entire contents of a collection, creating it if absent
    fn replace_collection(&mut self, collection: &str, documents: Vec<Document>) -> Result<()>;
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn stage_error(code: i32, message: impl Into<String>) -> ShadowDbError {
    ShadowDbError::command(code, message)
}

/// Parse `"$path"` into `path`
fn parse_field_path(value: &Value, stage: &str) -> Result<String> {
    match value.as_str() {
        Some(s) if s.starts_with('$') && s.len() > 1 => Ok(s[1..].to_string()),
        _ => Err(stage_error(
            codes::UNWIND_PATH_INVALID,
            format!("{} field path must be a string prefixed with '$'", stage),
        )),
    }
}

fn require_document<'a>(spec: &'a Value, stage: &str) -> Result<&'a Document> {
    spec.as_document().ok_or_else(|| {
        stage_error(
            codes::TYPE_MISMATCH,
            format!("{} specification must be an object", stage),
        )
    })
}

/// Integral count for `$limit` and `$skip`
fn parse_count(spec: &Value) -> Option<i64> {
    match spec.as_number()? {
        Number::Int(n) => Some(n),
        Number::Float(f) if f.fract() == 0.0 => Some(f as i64),
        Number::Float(_) => None,
    }
}

/// Aggregation pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(MatchStage),
    Project(ProjectStage),
    Group(GroupStage),
    Unwind(UnwindStage),
    Lookup(LookupStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
    Out(OutStage),
}

/// $match stage - filter documents
#[derive(Debug, Clone, PartialEq)]
pub struct MatchStage {
    query: Query,
}

/// $project stage - reshape documents
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectStage {
    mode: ProjectMode,
}

#[derive(Debug, Clone, PartialEq)]
enum ProjectMode {
    /// Only exclusions: delegate to the find projection engine
    Exclusion(Projection),
    Shape {
        include_id: bool,
        fields: Vec<(String, ProjectField)>,
        inclusions: Option<Projection>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    /// `1` / `true`
    Include,
    Computed(Expr),
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStage {
    id: Expr,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    kind: AccumulatorKind,
    operand: Expr,
}

/// Running state of one accumulator within one group
#[derive(Debug, Clone)]
enum AccumulatorState {
    Sum(Value),
    Avg { total: f64, count: usize },
    Extremum(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Values(Vec<Value>),
}

/// $unwind stage - one output document per array element
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindStage {
    path: String,
    options: UnwindOptions,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnwindOptions {
    /// Emit documents whose path is missing, null or an empty array
    pub preserve_null_and_empty_arrays: bool,
}

/// $lookup stage - left outer join against another collection
#[derive(Debug, Clone, PartialEq)]
pub struct LookupStage {
    from: String,
    local_field: String,
    foreign_field: String,
    as_field: String,
}

/// $sort stage - sort documents
#[derive(Debug, Clone, PartialEq)]
pub struct SortStage {
    fields: Vec<(String, i32)>,
}

/// $limit stage - limit number of documents
#[derive(Debug, Clone, PartialEq)]
pub struct LimitStage {
    limit: usize,
}

/// $skip stage - skip documents
#[derive(Debug, Clone, PartialEq)]
pub struct SkipStage {
    skip: usize,
}

/// $out stage - replace a collection with the pipeline output
#[derive(Debug, Clone, PartialEq)]
pub struct OutStage {
    collection: String,
}

impl Pipeline {
    /// Create pipeline from a stage array
    pub fn parse(pipeline: &Value) -> Result<Self> {
        let Value::Array(stages_array) = pipeline else {
            return Err(stage_error(
                codes::TYPE_MISMATCH,
                "pipeline must be an array of stage documents",
            ));
        };

        let mut stages = Vec::with_capacity(stages_array.len());
        for (position, stage_json) in stages_array.iter().enumerate() {
            let stage = Stage::parse(stage_json)?;
            if matches!(stage, Stage::Out(_)) && position + 1 != stages_array.len() {
                return Err(stage_error(
                    codes::OUT_MUST_BE_LAST,
                    "$out can only be the final stage in the pipeline",
                ));
            }
            stages.push(stage);
        }

        Ok(Pipeline { stages })
    }

    pub fn from_json(pipeline_json: &serde_json::Value) -> Result<Self> {
        Self::parse(&Value::from_json(pipeline_json))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Name of the `$out` target, if the pipeline ends with one
    pub fn output_collection(&self) -> Option<&str> {
        match self.stages.last() {
            Some(Stage::Out(out)) => Some(&out.collection),
            _ => None,
        }
    }

    /// Execute pipeline on documents
    pub fn execute(&self, mut docs: Vec<Document>, ctx: &mut dyn PipelineContext) -> Result<Vec<Document>> {
        log_debug!(
            "running pipeline of {} stages over {} documents",
            self.stages.len(),
            docs.len()
        );
        for stage in &self.stages {
            docs = stage.execute(docs, ctx)?;
        }
        Ok(docs)
    }
}

impl Stage {
    /// Parse stage from its `{ "$name": spec }` document
    fn parse(stage_json: &Value) -> Result<Self> {
        let obj = stage_json
            .as_document()
            .filter(|obj| obj.len() == 1)
            .ok_or_else(|| {
                stage_error(
                    codes::STAGE_ONE_FIELD,
                    "A pipeline stage specification object must contain exactly one field.",
                )
            })?;

        let Some((stage_name, stage_spec)) = obj.iter().next() else {
            return Err(stage_error(codes::STAGE_ONE_FIELD, "empty pipeline stage"));
        };

        match stage_name.as_str() {
            "$match" => Ok(Stage::Match(MatchStage::parse(stage_spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::parse(stage_spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::parse(stage_spec)?)),
            "$unwind" => Ok(Stage::Unwind(UnwindStage::parse(stage_spec)?)),
            "$lookup" => Ok(Stage::Lookup(LookupStage::parse(stage_spec)?)),
            "$sort" => Ok(Stage::Sort(SortStage::parse(stage_spec)?)),
            "$limit" => Ok(Stage::Limit(LimitStage::parse(stage_spec)?)),
            "$skip" => Ok(Stage::Skip(SkipStage::parse(stage_spec)?)),
            "$out" => Ok(Stage::Out(OutStage::parse(stage_spec)?)),
            _ => Err(stage_error(
                codes::UNKNOWN_STAGE,
                format!("Unrecognized pipeline stage name: '{}'", stage_name),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::Group(_) => "$group",
            Stage::Unwind(_) => "$unwind",
            Stage::Lookup(_) => "$lookup",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Out(_) => "$out",
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Document>, ctx: &mut dyn PipelineContext) -> Result<Vec<Document>> {
        match self {
            Stage::Match(stage) => stage.execute(docs),
            Stage::Project(stage) => stage.execute(docs),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Unwind(stage) => stage.execute(docs),
            Stage::Lookup(stage) => stage.execute(docs, ctx),
            Stage::Sort(stage) => stage.execute(docs),
            Stage::Limit(stage) => stage.execute(docs),
            Stage::Skip(stage) => stage.execute(docs),
            Stage::Out(stage) => stage.execute(docs, ctx),
        }
    }
}

impl MatchStage {
    fn parse(spec: &Value) -> Result<Self> {
        let filter = spec.as_document().ok_or_else(|| {
            ShadowDbError::MatchError("the match filter must be an expression in an object".to_string())
        })?;
        Ok(MatchStage {
            query: Query::parse(filter)?,
        })
    }

    fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            if self.query.matches(&doc)? {
                results.push(doc);
            }
        }
        Ok(results)
    }
}

/// Flatten nested sub-projections (`{a: {b: 1}}`) into dotted paths
fn flatten_project_spec(prefix: &str, spec: &Document, out: &mut Vec<(String, Value)>) {
    for (field, value) in spec {
        let full = if prefix.is_empty() {
            field.clone()
        } else {
            format!("{}.{}", prefix, field)
        };
        match value {
            Value::Object(sub) if !sub.is_empty() && !is_operator_document(value) => {
                flatten_project_spec(&full, sub, out)
            }
            other => out.push((full, other.clone())),
        }
    }
}

/// `Some(true)` for an inclusion flag, `Some(false)` for an exclusion flag
fn projection_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        v if v.is_number() => Some(v.as_f64() != Some(0.0)),
        _ => None,
    }
}

impl ProjectStage {
    fn parse(spec: &Value) -> Result<Self> {
        let obj = require_document(spec, "$project")?;
        if obj.is_empty() {
            return Err(stage_error(
                codes::PROJECT_REQUIRES_FIELDS,
                "$project requires at least one output field",
            ));
        }

        let mut flat = Vec::new();
        flatten_project_spec("", obj, &mut flat);

        let non_id_exclusions = flat
            .iter()
            .filter(|(field, value)| field != ID_FIELD && projection_flag(value) == Some(false))
            .count();
        if non_id_exclusions > 0 {
            if non_id_exclusions + usize::from(obj.contains_key(ID_FIELD)) < flat.len() {
                return Err(ShadowDbError::InvalidProjection(
                    "Cannot do inclusion on field in exclusion projection".to_string(),
                ));
            }
            let spec: Document = flat.into_iter().collect();
            return Ok(ProjectStage {
                mode: ProjectMode::Exclusion(Projection::parse(&spec)?),
            });
        }

        let mut include_id = true;
        let mut fields = Vec::new();
        let mut included_paths = Document::new();
        for (field, value) in flat {
            match projection_flag(&value) {
                Some(false) => include_id = false,
                Some(true) => {
                    if field != ID_FIELD {
                        included_paths.insert(field.clone(), Value::Int32(1));
                    }
                    fields.push((field, ProjectField::Include));
                }
                None => {
                    if field == ID_FIELD {
                        include_id = false;
                    }
                    fields.push((field, ProjectField::Computed(Expr::parse(&value)?)));
                }
            }
        }

        let inclusions = if included_paths.is_empty() {
            None
        } else {
            included_paths.insert(ID_FIELD, Value::Int32(0));
            Some(Projection::parse(&included_paths)?)
        };

        Ok(ProjectStage {
            mode: ProjectMode::Shape {
                include_id,
                fields,
                inclusions,
            },
        })
    }

    fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        docs.iter().map(|doc| self.project_document(doc)).collect()
    }

    fn project_document(&self, doc: &Document) -> Result<Document> {
        let (include_id, fields, inclusions) = match &self.mode {
            ProjectMode::Exclusion(projection) => return projection.apply(doc),
            ProjectMode::Shape {
                include_id,
                fields,
                inclusions,
            } => (*include_id, fields, inclusions),
        };

        let mut result = Document::new();
        if include_id {
            if let Some(id) = doc.id() {
                result.insert(ID_FIELD, id.clone());
            }
        }

        let included = inclusions.as_ref().map(|p| p.apply(doc)).transpose()?;

        for (field, action) in fields {
            match action {
                ProjectField::Include => {
                    let top = field.split('.').next().unwrap_or(field);
                    if let Some(value) = included.as_ref().and_then(|d| d.get(top)) {
                        let merged = match result.get(top) {
                            Some(computed) => merge_included(value, computed.clone()),
                            None => value.clone(),
                        };
                        result.insert(top, merged);
                    }
                }
                ProjectField::Computed(expr) => {
                    if let Evaluated::Value(value) = expr.evaluate(doc)? {
                        path::set_path(&mut result, field, value)?;
                    }
                }
            }
        }

        result.move_id_first();
        Ok(result)
    }
}

/// Overlay computed subfields onto an included subtree, included fields first
fn merge_included(included: &Value, computed: Value) -> Value {
    match (included, computed) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (key, value) in extra {
                let value = match base.get(&key) {
                    Some(existing) => merge_included(existing, value),
                    None => value,
                };
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, computed) => computed,
    }
}

impl GroupStage {
    fn parse(spec: &Value) -> Result<Self> {
        let obj = require_document(spec, "$group")?;
        let id = obj.get(ID_FIELD).ok_or_else(|| {
            stage_error(
                codes::GROUP_REQUIRES_ID,
                "a group specification must include an _id",
            )
        })?;

        let mut accumulators = Vec::new();
        for (field, value) in obj {
            if field == ID_FIELD {
                continue;
            }
            accumulators.push((field.clone(), Accumulator::parse(field, value)?));
        }

        Ok(GroupStage {
            id: Expr::parse(id)?,
            accumulators,
        })
    }

    fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        // Groups come out in first-seen key order
        let mut groups: IndexMap<Value, Vec<AccumulatorState>> = IndexMap::new();

        for doc in &docs {
            let key = self.id.evaluate_value(doc)?;
            let states = groups.entry(key).or_insert_with(|| {
                self.accumulators
                    .iter()
                    .map(|(_, acc)| AccumulatorState::new(acc.kind))
                    .collect()
            });
            for ((_, accumulator), state) in self.accumulators.iter().zip(states.iter_mut()) {
                state.update(accumulator.kind, accumulator.operand.evaluate(doc)?)?;
            }
        }

        Ok(groups
            .into_iter()
            .map(|(key, states)| {
                let mut result = Document::new();
                result.insert(ID_FIELD, key);
                for ((field, _), state) in self.accumulators.iter().zip(states) {
                    result.insert(field.clone(), state.finish());
                }
                result
            })
            .collect())
    }
}

impl Accumulator {
    fn parse(field: &str, spec: &Value) -> Result<Self> {
        let obj = spec.as_document().filter(|obj| obj.len() == 1).ok_or_else(|| {
            stage_error(
                codes::GROUP_FIELD_NOT_OBJECT,
                format!("The field '{}' must be an accumulator object", field),
            )
        })?;
        let Some((op, operand)) = obj.iter().next() else {
            return Err(stage_error(codes::GROUP_FIELD_NOT_OBJECT, "empty accumulator"));
        };

        let kind = match op.as_str() {
            "$sum" => AccumulatorKind::Sum,
            "$avg" => AccumulatorKind::Avg,
            "$min" => AccumulatorKind::Min,
            "$max" => AccumulatorKind::Max,
            "$first" => AccumulatorKind::First,
            "$last" => AccumulatorKind::Last,
            "$push" => AccumulatorKind::Push,
            "$addToSet" => AccumulatorKind::AddToSet,
            _ => {
                return Err(stage_error(
                    codes::UNKNOWN_GROUP_OPERATOR,
                    format!("unknown group operator '{}'", op),
                ))
            }
        };

        Ok(Accumulator {
            kind,
            operand: Expr::parse(operand)?,
        })
    }
}

fn add_numbers(total: &Value, value: &Value) -> Value {
    match (total.as_number(), value.as_number()) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => match a.checked_add(b) {
            Some(sum) => match (total, value, i32::try_from(sum)) {
                (Value::Int32(_), Value::Int32(_), Ok(small)) => Value::Int32(small),
                _ => Value::Int64(sum),
            },
            None => Value::Double(a as f64 + b as f64),
        },
        (Some(a), Some(b)) => Value::Double(a.as_f64() + b.as_f64()),
        _ => total.clone(),
    }
}

impl AccumulatorState {
    fn new(kind: AccumulatorKind) -> Self {
        match kind {
            AccumulatorKind::Sum => AccumulatorState::Sum(Value::Int32(0)),
            AccumulatorKind::Avg => AccumulatorState::Avg { total: 0.0, count: 0 },
            AccumulatorKind::Min | AccumulatorKind::Max => AccumulatorState::Extremum(None),
            AccumulatorKind::First => AccumulatorState::First(None),
            AccumulatorKind::Last => AccumulatorState::Last(Value::Null),
            AccumulatorKind::Push | AccumulatorKind::AddToSet => AccumulatorState::Values(Vec::new()),
        }
    }

    fn update(&mut self, kind: AccumulatorKind, value: Evaluated) -> Result<()> {
        match self {
            AccumulatorState::Sum(total) => {
                // Non-numeric values are ignored
                if let Evaluated::Value(v) = value {
                    if v.is_number() {
                        *total = add_numbers(total, &v);
                    }
                }
            }
            AccumulatorState::Avg { total, count } => {
                if let Some(n) = value.into_option().and_then(|v| v.as_f64()) {
                    *total += n;
                    *count += 1;
                }
            }
            AccumulatorState::Extremum(current) => {
                let Evaluated::Value(v) = value else {
                    return Ok(());
                };
                if v.is_null() {
                    return Ok(());
                }
                let replace = match current {
                    None => true,
                    Some(existing) if kind == AccumulatorKind::Min => v < *existing,
                    Some(existing) => v > *existing,
                };
                if replace {
                    *current = Some(v);
                }
            }
            AccumulatorState::First(first) => {
                if first.is_none() {
                    *first = Some(value.or_null());
                }
            }
            AccumulatorState::Last(last) => *last = value.or_null(),
            AccumulatorState::Values(values) => {
                if let Evaluated::Value(v) = value {
                    if kind == AccumulatorKind::Push || !values.contains(&v) {
                        values.push(v);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum(total) => total,
            AccumulatorState::Avg { count: 0, .. } => Value::Null,
            AccumulatorState::Avg { total, count } => Value::Double(total / count as f64),
            AccumulatorState::Extremum(v) | AccumulatorState::First(v) => v.unwrap_or(Value::Null),
            AccumulatorState::Last(v) => v,
            AccumulatorState::Values(values) => Value::Array(values),
        }
    }
}

impl UnwindStage {
    fn parse(spec: &Value) -> Result<Self> {
        match spec {
            Value::Object(obj) => {
                let path_value = obj.get("path").ok_or_else(|| {
                    stage_error(codes::UNWIND_PATH_INVALID, "no path specified to $unwind stage")
                })?;
                let preserve = match obj.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => {
                        return Err(stage_error(
                            codes::TYPE_MISMATCH,
                            "expected a boolean for the preserveNullAndEmptyArrays option to $unwind stage",
                        ))
                    }
                };
                if let Some(unknown) = obj
                    .keys()
                    .find(|k| !matches!(k.as_str(), "path" | "preserveNullAndEmptyArrays"))
                {
                    return Err(stage_error(
                        codes::UNWIND_PATH_INVALID,
                        format!("unrecognized option to $unwind stage: {}", unknown),
                    ));
                }
                Ok(UnwindStage {
                    path: parse_field_path(path_value, "$unwind")?,
                    options: UnwindOptions {
                        preserve_null_and_empty_arrays: preserve,
                    },
                })
            }
            other => Ok(UnwindStage {
                path: parse_field_path(other, "$unwind")?,
                options: UnwindOptions::default(),
            }),
        }
    }

    fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let preserve = self.options.preserve_null_and_empty_arrays;
        let mut results = Vec::with_capacity(docs.len());

        for doc in docs {
            match path::get_path(&doc, &self.path).cloned() {
                Some(Value::Array(items)) if !items.is_empty() => {
                    for item in items {
                        let mut unwound = doc.clone();
                        path::set_path(&mut unwound, &self.path, item)?;
                        results.push(unwound);
                    }
                }
                Some(Value::Array(_)) => {
                    if preserve {
                        let mut kept = doc;
                        path::unset_path(&mut kept, &self.path);
                        results.push(kept);
                    }
                }
                None | Some(Value::Null) => {
                    if preserve {
                        results.push(doc);
                    }
                }
                // A scalar is treated as a one-element array
                Some(_) => results.push(doc),
            }
        }

        Ok(results)
    }
}

impl LookupStage {
    fn parse(spec: &Value) -> Result<Self> {
        let obj = require_document(spec, "$lookup")?;
        let field = |name: &str| -> Result<String> {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    stage_error(
                        codes::LOOKUP_ARGUMENT_INVALID,
                        format!("$lookup argument '{}' must be a string", name),
                    )
                })
        };
        if let Some(unknown) = obj
            .keys()
            .find(|k| !matches!(k.as_str(), "from" | "localField" | "foreignField" | "as"))
        {
            return Err(stage_error(
                codes::LOOKUP_ARGUMENT_INVALID,
                format!("unknown argument to $lookup: {}", unknown),
            ));
        }
        Ok(LookupStage {
            from: field("from")?,
            local_field: field("localField")?,
            foreign_field: field("foreignField")?,
            as_field: field("as")?,
        })
    }

    /// Values a local document joins on; a missing field joins as null
    fn local_values(&self, doc: &Document) -> Vec<Value> {
        let resolved = path::resolve(doc, &self.local_field);
        if resolved.is_empty() {
            return vec![Value::Null];
        }
        let mut values = Vec::new();
        for value in resolved {
            match value {
                Value::Array(items) => values.extend(items.iter().cloned()),
                other => values.push(other.clone()),
            }
        }
        values
    }

    fn execute(&self, docs: Vec<Document>, ctx: &mut dyn PipelineContext) -> Result<Vec<Document>> {
        let foreign = ctx.documents(&self.from);
        let mut results = Vec::with_capacity(docs.len());

        for mut doc in docs {
            let mut filter = Document::new();
            let mut condition = Document::new();
            condition.insert("$in", Value::Array(self.local_values(&doc)));
            filter.insert(self.foreign_field.clone(), condition);

            let mut joined = Vec::new();
            for candidate in &foreign {
                if matches_filter(candidate, &filter)? {
                    joined.push(Value::Object(candidate.clone()));
                }
            }
            path::set_path(&mut doc, &self.as_field, Value::Array(joined))?;
            results.push(doc);
        }

        Ok(results)
    }
}

impl SortStage {
    fn parse(spec: &Value) -> Result<Self> {
        let obj = spec.as_document().ok_or_else(|| {
            stage_error(codes::SORT_REQUIRES_KEY, "the $sort key specification must be an object")
        })?;
        Ok(SortStage {
            fields: parse_sort(obj)?,
        })
    }

    fn execute(&self, mut docs: Vec<Document>) -> Result<Vec<Document>> {
        apply_sort(&mut docs, &self.fields);
        Ok(docs)
    }
}

impl LimitStage {
    fn parse(spec: &Value) -> Result<Self> {
        match parse_count(spec) {
            Some(n) if n > 0 => Ok(LimitStage { limit: n as usize }),
            _ => Err(stage_error(
                codes::LIMIT_MUST_BE_POSITIVE,
                "the limit must be positive",
            )),
        }
    }

    fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        Ok(docs.into_iter().take(self.limit).collect())
    }
}

impl SkipStage {
    fn parse(spec: &Value) -> Result<Self> {
        match parse_count(spec) {
            Some(n) if n >= 0 => Ok(SkipStage { skip: n as usize }),
            _ => Err(stage_error(
                codes::SKIP_MUST_BE_NON_NEGATIVE,
                "$skip must be a non-negative number",
            )),
        }
    }

    fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        Ok(docs.into_iter().skip(self.skip).collect())
    }
}

impl OutStage {
    fn parse(spec: &Value) -> Result<Self> {
        match spec.as_str() {
            Some(name) if !name.is_empty() => Ok(OutStage {
                collection: name.to_string(),
            }),
            _ => Err(stage_error(
                codes::OUT_REQUIRES_STRING,
                "$out only supports a string argument",
            )),
        }
    }

    fn execute(&self, docs: Vec<Document>, ctx: &mut dyn PipelineContext) -> Result<Vec<Document>> {
        ctx.replace_collection(&self.collection, docs.clone())?;
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Collections(HashMap<String, Vec<Document>>);

    impl PipelineContext for Collections {
        fn documents(&self, collection: &str) -> Vec<Document> {
            self.0.get(collection).cloned().unwrap_or_default()
        }

        fn replace_collection(&mut self, collection: &str, documents: Vec<Document>) -> Result<()> {
            self.0.insert(collection.to_string(), documents);
            Ok(())
        }
    }

    fn docs(values: serde_json::Value) -> Vec<Document> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| Document::from_json(v).unwrap())
            .collect()
    }

    fn to_json(docs: Vec<Document>) -> serde_json::Value {
        serde_json::Value::Array(docs.iter().map(Document::to_json).collect())
    }

    fn run(pipeline: serde_json::Value, input: serde_json::Value) -> Result<serde_json::Value> {
        let pipeline = Pipeline::from_json(&pipeline)?;
        let out = pipeline.execute(docs(input), &mut Collections::default())?;
        Ok(to_json(out))
    }

    // ========== Pipeline parsing ==========

    #[test]
    fn test_pipeline_not_array() {
        let err = Pipeline::from_json(&json!({"$match": {}})).unwrap_err();
        assert_eq!(err.code(), 14);
    }

    #[test]
    fn test_pipeline_empty_is_identity() {
        let out = run(json!([]), json!([{"_id": 1}])).unwrap();
        assert_eq!(out, json!([{"_id": 1}]));
    }

    #[test]
    fn test_stage_multiple_operators() {
        let err = Pipeline::from_json(&json!([{"$match": {}, "$limit": 1}])).unwrap_err();
        assert_eq!(err.code(), 40323);
        let err = Pipeline::from_json(&json!([5])).unwrap_err();
        assert_eq!(err.code(), 40323);
    }

    #[test]
    fn test_stage_unknown_operator() {
        let err = Pipeline::from_json(&json!([{"$bogus": {}}])).unwrap_err();
        assert_eq!(err.code(), 40324);
        assert!(err.to_string().contains("$bogus"));
    }

    #[test]
    fn test_out_must_be_last() {
        let err = Pipeline::from_json(&json!([{"$out": "x"}, {"$limit": 1}])).unwrap_err();
        assert_eq!(err.code(), 16991);
        let pipeline = Pipeline::from_json(&json!([{"$limit": 1}, {"$out": "x"}])).unwrap();
        assert_eq!(pipeline.output_collection(), Some("x"));
    }

    // ========== $match ==========

    #[test]
    fn test_match_filters() {
        let out = run(
            json!([{"$match": {"n": {"$gte": 2}}}]),
            json!([{"_id": 1, "n": 1}, {"_id": 2, "n": 2}, {"_id": 3, "n": 3}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 2, "n": 2}, {"_id": 3, "n": 3}]));
    }

    #[test]
    fn test_match_unknown_operator_aborts() {
        let err = Pipeline::from_json(&json!([{"$match": {"n": {"$bogus": 1}}}])).unwrap_err();
        assert!(err.to_string().contains("unknown operator"));
    }

    // ========== $project ==========

    #[test]
    fn test_project_computed_fields() {
        let out = run(
            json!([{"$project": {"food": {"$toUpper": "$type"}}}]),
            json!([{"_id": 1, "type": "apple"}, {"_id": 2, "type": "cherry"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 1, "food": "APPLE"}, {"_id": 2, "food": "CHERRY"}]));
    }

    #[test]
    fn test_project_id_first_then_spec_order() {
        let out = run(
            json!([{"$project": {"b": 1, "renamed": "$a", "_id": 1}}]),
            json!([{"a": 1, "b": 2, "_id": 7}]),
        )
        .unwrap();
        assert_eq!(serde_json::to_string(&out).unwrap(), r#"[{"_id":7,"b":2,"renamed":1}]"#);
    }

    #[test]
    fn test_project_exclude_id_and_nested() {
        let out = run(
            json!([{"$project": {"_id": 0, "a.b": 1, "c": {"d": "$x"}}}]),
            json!([{"_id": 1, "a": {"b": 5, "z": 0}, "x": 9}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"a": {"b": 5}, "c": {"d": 9}}]));
    }

    #[test]
    fn test_project_exclusion_mode() {
        let out = run(
            json!([{"$project": {"secret": 0}}]),
            json!([{"_id": 1, "secret": "x", "keep": true}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 1, "keep": true}]));
    }

    #[test]
    fn test_project_missing_computed_field_omitted() {
        let out = run(json!([{"$project": {"v": "$nope"}}]), json!([{"_id": 1}])).unwrap();
        assert_eq!(out, json!([{"_id": 1}]));
    }

    #[test]
    fn test_project_errors() {
        assert_eq!(Pipeline::from_json(&json!([{"$project": {}}])).unwrap_err().code(), 16435);
        let err = Pipeline::from_json(&json!([{"$project": {"a": 0, "b": 1}}])).unwrap_err();
        assert!(matches!(err, ShadowDbError::InvalidProjection(_)));
        let err = Pipeline::from_json(&json!([{"$project": {"a": {"$strcasecmp": ["$a"]}}}])).unwrap_err();
        assert_eq!(err.code(), 16020);
    }

    #[test]
    fn test_project_failure_aborts_pipeline() {
        let err = run(
            json!([{"$project": {"n": {"$size": "$tags"}}}]),
            json!([{"_id": 1, "tags": []}, {"_id": 2, "tags": 3}]),
        )
        .unwrap_err();
        assert_eq!(err.code(), 17124);
    }

    // ========== $group ==========

    #[test]
    fn test_group_requires_id() {
        let err = Pipeline::from_json(&json!([{"$group": {"n": {"$sum": 1}}}])).unwrap_err();
        assert_eq!(err.code(), 15955);
    }

    #[test]
    fn test_group_unknown_accumulator() {
        let err = Pipeline::from_json(&json!([{"$group": {"_id": null, "n": {"$median": 1}}}])).unwrap_err();
        assert_eq!(err.code(), 15952);
        let err = Pipeline::from_json(&json!([{"$group": {"_id": null, "n": 1}}])).unwrap_err();
        assert_eq!(err.code(), 40234);
    }

    #[test]
    fn test_group_first_seen_order_and_accumulators() {
        let out = run(
            json!([{"$group": {
                "_id": "$city",
                "count": {"$sum": 1},
                "total": {"$sum": "$amount"},
                "avg": {"$avg": "$amount"},
                "min": {"$min": "$amount"},
                "max": {"$max": "$amount"},
                "first": {"$first": "$name"},
                "last": {"$last": "$name"},
                "names": {"$push": "$name"}
            }}]),
            json!([
                {"_id": 1, "city": "NYC", "amount": 10, "name": "a"},
                {"_id": 2, "city": "LA", "amount": 5, "name": "b"},
                {"_id": 3, "city": "NYC", "amount": 30, "name": "c"}
            ]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": "NYC", "count": 2, "total": 40, "avg": 20.0, "min": 10, "max": 30,
                 "first": "a", "last": "c", "names": ["a", "c"]},
                {"_id": "LA", "count": 1, "total": 5, "avg": 5.0, "min": 5, "max": 5,
                 "first": "b", "last": "b", "names": ["b"]}
            ])
        );
    }

    #[test]
    fn test_group_null_id_and_missing_values() {
        let out = run(
            json!([{"$group": {"_id": null, "tags": {"$addToSet": "$tag"}, "avg": {"$avg": "$nope"}}}]),
            json!([{"tag": "x"}, {"tag": "y"}, {"tag": "x"}, {}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": null, "tags": ["x", "y"], "avg": null}]));
    }

    #[test]
    fn test_group_compound_key() {
        let out = run(
            json!([{"$group": {"_id": {"a": "$a", "b": "$b"}, "n": {"$sum": 1}}}]),
            json!([{"a": 1, "b": 2}, {"a": 1, "b": 2}, {"a": 1}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": {"a": 1, "b": 2}, "n": 2}, {"_id": {"a": 1}, "n": 1}]));
    }

    #[test]
    fn test_group_sum_mixed_widths() {
        let out = run(
            json!([{"$group": {"_id": null, "s": {"$sum": "$v"}}}]),
            json!([{"v": 1}, {"v": 2.5}, {"v": "str"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": null, "s": 3.5}]));
    }

    // ========== $unwind ==========

    #[test]
    fn test_unwind_arrays() {
        let out = run(
            json!([{"$unwind": "$tags"}]),
            json!([
                {"_id": 1, "tags": ["a", "b"]},
                {"_id": 2, "tags": []},
                {"_id": 3},
                {"_id": 4, "tags": ["x"]},
                {"_id": 5, "tags": "scalar"}
            ]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": 1, "tags": "a"},
                {"_id": 1, "tags": "b"},
                {"_id": 4, "tags": "x"},
                {"_id": 5, "tags": "scalar"}
            ])
        );
    }

    #[test]
    fn test_unwind_preserve_null_and_empty() {
        let out = run(
            json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]),
            json!([{"_id": 1, "tags": []}, {"_id": 2}, {"_id": 3, "tags": null}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 1}, {"_id": 2}, {"_id": 3, "tags": null}]));
    }

    #[test]
    fn test_unwind_requires_dollar_path() {
        let err = Pipeline::from_json(&json!([{"$unwind": "tags"}])).unwrap_err();
        assert_eq!(err.code(), 28818);
    }

    // ========== $lookup ==========

    #[test]
    fn test_lookup_preserves_every_left_document() {
        let mut ctx = Collections::default();
        ctx.0.insert(
            "children".into(),
            docs(json!([
                {"_id": "s1", "parentId": "p1"},
                {"_id": "s2", "parentId": "p1"},
                {"_id": "s3", "parentId": "p2"}
            ])),
        );
        let pipeline = Pipeline::from_json(&json!([{"$lookup": {
            "from": "children", "localField": "_id", "foreignField": "parentId", "as": "items"
        }}]))
        .unwrap();
        let out = pipeline
            .execute(docs(json!([{"_id": "p1"}, {"_id": "p3"}, {"other": 1}])), &mut ctx)
            .unwrap();
        assert_eq!(
            to_json(out),
            json!([
                {"_id": "p1", "items": [{"_id": "s1", "parentId": "p1"}, {"_id": "s2", "parentId": "p1"}]},
                {"_id": "p3", "items": []},
                {"other": 1, "items": []}
            ])
        );
    }

    #[test]
    fn test_lookup_array_local_field() {
        let mut ctx = Collections::default();
        ctx.0.insert("tags".into(), docs(json!([{"_id": "a"}, {"_id": "b"}, {"_id": "c"}])));
        let pipeline = Pipeline::from_json(&json!([{"$lookup": {
            "from": "tags", "localField": "refs", "foreignField": "_id", "as": "joined"
        }}]))
        .unwrap();
        let out = pipeline.execute(docs(json!([{"_id": 1, "refs": ["a", "c"]}])), &mut ctx).unwrap();
        assert_eq!(to_json(out)[0]["joined"], json!([{"_id": "a"}, {"_id": "c"}]));
    }

    #[test]
    fn test_lookup_requires_string_arguments() {
        let err = Pipeline::from_json(&json!([{"$lookup": {"from": "x", "localField": "a", "as": "b"}}])).unwrap_err();
        assert_eq!(err.code(), 4572);
    }

    // ========== $sort / $limit / $skip ==========

    #[test]
    fn test_sort_limit_skip() {
        let out = run(
            json!([{"$sort": {"n": -1}}, {"$skip": 1}, {"$limit": 2}]),
            json!([{"n": 1}, {"n": 4}, {"n": 3}, {"n": 2}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"n": 3}, {"n": 2}]));
    }

    #[test]
    fn test_sort_is_stable() {
        let out = run(
            json!([{"$sort": {"k": 1}}]),
            json!([{"k": 1, "t": "a"}, {"k": 0, "t": "b"}, {"k": 1, "t": "c"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"k": 0, "t": "b"}, {"k": 1, "t": "a"}, {"k": 1, "t": "c"}]));
    }

    #[test]
    fn test_stage_argument_errors() {
        assert_eq!(Pipeline::from_json(&json!([{"$limit": 0}])).unwrap_err().code(), 15958);
        assert_eq!(Pipeline::from_json(&json!([{"$limit": -1}])).unwrap_err().code(), 15958);
        assert_eq!(Pipeline::from_json(&json!([{"$skip": -1}])).unwrap_err().code(), 15956);
        assert_eq!(Pipeline::from_json(&json!([{"$sort": {"a": 2}}])).unwrap_err().code(), 15975);
        assert_eq!(Pipeline::from_json(&json!([{"$sort": {}}])).unwrap_err().code(), 15976);
        assert_eq!(Pipeline::from_json(&json!([{"$out": 1}])).unwrap_err().code(), 16990);
    }

    // ========== $out ==========

    #[test]
    fn test_out_replaces_target_and_passes_through() {
        let mut ctx = Collections::default();
        ctx.0.insert("target".into(), docs(json!([{"_id": "old"}])));
        let pipeline = Pipeline::from_json(&json!([{"$match": {"keep": true}}, {"$out": "target"}])).unwrap();
        let out = pipeline
            .execute(docs(json!([{"_id": 1, "keep": true}, {"_id": 2, "keep": false}])), &mut ctx)
            .unwrap();
        assert_eq!(to_json(out), json!([{"_id": 1, "keep": true}]));
        assert_eq!(to_json(ctx.documents("target")), json!([{"_id": 1, "keep": true}]));
    }
}

//! The parsed command surface the drivers hand to the engine, plus the
//! variable-selection and history rules shared by every command.

use crate::dataset::{Attribute, Variable};
use crate::grid::Grid;
use crate::slab::{CoordHyperslab, IndexHyperslab, LatLonBox};
use chrono::Utc;
use itertools::Itertools;
use log::warn;
use pagoda_array::{BinaryOp, ReduceOp};
use pagoda_types::FileFormat;
use std::collections::HashSet;
use std::path::PathBuf;

/// Everything the (externally parsed) command line tells the engine.
#[derive(Clone, Debug)]
pub struct CommandOptions {
    pub slabs: Vec<IndexHyperslab>,
    pub coord_slabs: Vec<CoordHyperslab>,
    pub boxes: Vec<LatLonBox>,
    /// `-v`: selected variable names; empty selects everything.
    pub variables: Vec<String>,
    /// `-x`: invert the variable selection.
    pub exclude: bool,
    /// `-c`: include every coordinate variable of a recognized grid.
    pub all_coords: bool,
    /// `-C`: do not pull in associated coordinate variables.
    pub no_coords: bool,
    /// cleared by `-h`.
    pub modify_history: bool,
    /// `--fix_rec_dmn`
    pub fix_record_dimension: bool,
    /// `--header_pad N`
    pub header_pad: Option<i64>,
    pub file_format: Option<FileFormat>,
    /// `--nbio`
    pub nonblocking: bool,
    /// `--allrec`: read whole record variables instead of streaming.
    pub whole_records: bool,
    pub append: bool,
    pub overwrite: bool,
    /// `-j dim`
    pub join: Option<String>,
    /// `-u`
    pub union_agg: bool,
    /// `-p prefix`
    pub prefix: Option<PathBuf>,
    pub reduce_op: Option<ReduceOp>,
    pub binary_op: Option<BinaryOp>,
    /// `--groups N`
    pub groups: usize,
}

impl Default for CommandOptions {
    fn default() -> CommandOptions {
        CommandOptions {
            slabs: Vec::new(),
            coord_slabs: Vec::new(),
            boxes: Vec::new(),
            variables: Vec::new(),
            exclude: false,
            all_coords: false,
            no_coords: false,
            modify_history: true,
            fix_record_dimension: false,
            header_pad: None,
            file_format: None,
            nonblocking: false,
            whole_records: false,
            append: false,
            overwrite: false,
            join: None,
            union_agg: false,
            prefix: None,
            reduce_op: None,
            binary_op: None,
            groups: 1,
        }
    }
}

impl CommandOptions {
    /// Resolve an input filename against `-p`.
    pub fn input_path(&self, name: &str) -> PathBuf {
        match &self.prefix {
            Some(prefix) => prefix.join(name),
            None => PathBuf::from(name),
        }
    }
}

/// A variable is a classic coordinate variable when it is 1-D and named
/// after its dimension.
fn is_coordinate_variable(var: &Variable) -> bool {
    var.ndim() == 1 && var.dims[0].name == var.name
}

/// Apply the `-v/-x/-c/-C` rules to a dataset's variables, preserving
/// define order. Selected names that do not exist are reported and skipped.
pub fn select_variables(
    vars: &[Variable],
    grid: Option<&Grid>,
    options: &CommandOptions,
) -> Vec<String> {
    let requested: HashSet<&str> = options.variables.iter().map(|s| s.as_str()).collect();
    for name in &requested {
        if !vars.iter().any(|v| v.name == *name) {
            warn!("selected variable '{}' does not exist", name);
        }
    }

    let mut keep: Vec<&Variable> = if requested.is_empty() {
        vars.iter().collect()
    } else if options.exclude {
        vars.iter()
            .filter(|v| !requested.contains(v.name.as_str()))
            .collect()
    } else {
        vars.iter()
            .filter(|v| requested.contains(v.name.as_str()))
            .collect()
    };

    if options.all_coords {
        if let Some(grid) = grid {
            for name in grid.special_variables() {
                if let Some(var) = vars.iter().find(|v| v.name == name) {
                    keep.push(var);
                }
            }
        }
    }

    if !options.no_coords {
        // pull in the coordinate variables of every kept dimension
        let used_dims: HashSet<String> = keep
            .iter()
            .flat_map(|v| v.dims.iter().map(|d| d.name.clone()))
            .collect();
        for var in vars {
            let associated = is_coordinate_variable(var) && used_dims.contains(&var.dims[0].name)
                || grid.map_or(false, |g| {
                    g.is_coordinate(&var.name)
                        && var.dims.iter().any(|d| used_dims.contains(&d.name))
                });
            if associated {
                keep.push(var);
            }
        }
    }

    let kept: HashSet<&str> = keep.iter().map(|v| v.name.as_str()).collect();
    vars.iter()
        .map(|v| v.name.as_str())
        .filter(|name| kept.contains(name))
        .map(|name| name.to_string())
        .unique()
        .collect()
}

/// Prepend `"<timestamp>: <command line>"` to the global `history`
/// attribute, creating it when absent.
pub fn append_history(atts: &mut Vec<Attribute>, cmdline: &str) {
    let stamp = Utc::now().format("%a %b %e %H:%M:%S %Y");
    let mut line = format!("{}: {}\n", stamp, cmdline);
    if let Some(existing) = atts.iter().position(|a| a.name == "history") {
        let old = atts[existing].as_string().unwrap_or_default();
        line.push_str(&old);
        atts[existing] = Attribute::text("history", &line);
    } else {
        atts.push(Attribute::text("history", &line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dimension;
    use pagoda_types::DataType;

    fn sample_vars() -> Vec<Variable> {
        let time = Dimension::record("time", 4);
        let cells = Dimension::fixed("cells", 6);
        vec![
            Variable::new("time", DataType::F64, vec![time.clone()]),
            Variable::new("T", DataType::F64, vec![time.clone(), cells.clone()]),
            Variable::new("P", DataType::F64, vec![time.clone(), cells.clone()]),
            Variable::new("other", DataType::I32, vec![cells]),
        ]
    }

    #[test]
    fn empty_selection_keeps_everything() {
        let vars = sample_vars();
        let names = select_variables(&vars, None, &CommandOptions::default());
        assert_eq!(names, vec!["time", "T", "P", "other"]);
    }

    #[test]
    fn selection_pulls_in_coordinates() {
        let vars = sample_vars();
        let options = CommandOptions {
            variables: vec!["T".to_string()],
            ..Default::default()
        };
        let names = select_variables(&vars, None, &options);
        assert_eq!(names, vec!["time", "T"]);
    }

    #[test]
    fn exclusion_inverts_and_no_coords_suppresses() {
        let vars = sample_vars();
        let options = CommandOptions {
            variables: vec!["T".to_string(), "P".to_string()],
            exclude: true,
            no_coords: true,
            ..Default::default()
        };
        let names = select_variables(&vars, None, &options);
        assert_eq!(names, vec!["time", "other"]);

        let options = CommandOptions {
            variables: vec!["T".to_string()],
            no_coords: true,
            ..Default::default()
        };
        let names = select_variables(&vars, None, &options);
        assert_eq!(names, vec!["T"]);
    }

    #[test]
    fn history_prepends_newest_first() {
        let mut atts = vec![Attribute::text("history", "old entry\n")];
        append_history(&mut atts, "pgsub -d time,0,1 in.nc out.nc");
        let text = atts[0].as_string().unwrap();
        assert!(text.contains("pgsub -d time,0,1"));
        assert!(text.ends_with("old entry\n"));
        let first_line = text.lines().next().unwrap();
        assert!(first_line.ends_with("pgsub -d time,0,1 in.nc out.nc"));
    }

    #[test]
    fn history_created_when_missing() {
        let mut atts = Vec::new();
        append_history(&mut atts, "pgra -y avg in.nc out.nc");
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].name, "history");
    }
}

//! The engine behind the command drivers: open (possibly aggregated)
//! inputs, build masks from the parsed selections, and move data through
//! pack/reduce/combine into the writer.

use crate::reader::CdfDataset;
use crate::store::VaraStore;
use crate::writer::{FileWriter, WriterOptions};
use log::warn;
use pagoda_array::{pack_into_new, BinaryOp, DistributedArray, ReduceOp};
use pagoda_core::{
    append_history, select_variables, AggregationJoinExisting, AggregationUnion, CommandOptions,
    Dataset, Dimension, Grid, GridKind, Mask, MaskMap, Variable,
};
use pagoda_net::Collectives;
use pagoda_types::{DataType, PagodaError, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;

fn writer_options(options: &CommandOptions) -> WriterOptions {
    WriterOptions {
        append: options.append,
        overwrite: options.overwrite,
        fix_record_dimension: options.fix_record_dimension,
        header_pad: options.header_pad,
        format: options.file_format,
    }
}

/// Open the input files as a single dataset: a join or union aggregation
/// when requested, the first file otherwise.
pub async fn open_inputs<S: VaraStore, N: Collectives + 'static>(
    store: &S,
    names: &[&str],
    options: &CommandOptions,
    net: &N,
) -> Result<Box<dyn Dataset<N>>> {
    if let Some(join) = &options.join {
        let mut agg = AggregationJoinExisting::new(join.clone());
        for name in names {
            let ds = CdfDataset::open(store, &options.input_path(name), net).await?;
            agg.add(Box::new(ds))?;
        }
        Ok(Box::new(agg))
    } else if options.union_agg {
        let mut agg = AggregationUnion::new();
        for name in names {
            let ds = CdfDataset::open(store, &options.input_path(name), net).await?;
            agg.add(Box::new(ds))?;
        }
        Ok(Box::new(agg))
    } else {
        let name = names
            .first()
            .ok_or_else(|| PagodaError::Command("no input files given".to_string()))?;
        let ds = CdfDataset::open(store, &options.input_path(name), net).await?;
        Ok(Box::new(ds))
    }
}

async fn apply_box<N: Collectives + 'static, D: Dataset<N> + ?Sized>(
    dataset: &D,
    grid: Option<&Grid>,
    box_: &pagoda_core::LatLonBox,
    masks: &mut MaskMap,
    net: &N,
) -> Result<()> {
    let Some(grid) = grid else {
        warn!("no grid recognized; a lat/lon box selects nothing");
        return Ok(());
    };
    match grid.kind {
        GridKind::Geodesic => {
            let lat_name = grid.get_cell_lat().unwrap();
            let lon_name = grid.get_cell_lon().unwrap();
            let cell_dim = dataset
                .get_dim(grid.get_cell_dim().unwrap())
                .ok_or_else(|| PagodaError::Internal("grid cell dimension vanished".to_string()))?
                .clone();
            let lat = dataset.read(lat_name, net).await?;
            let lon = dataset.read(lon_name, net).await?;
            masks.get_mask(&cell_dim, net)?.modify_box(box_, &lat, &lon)?;

            // keep whole cells: pull every referenced corner and edge back in
            let targets = [
                (grid.get_cell_corners(), grid.get_corner_dim()),
                (grid.get_cell_edges(), grid.get_edge_dim()),
            ];
            for (topology, target) in targets {
                let (Some(topology), Some(target)) = (topology, target) else {
                    continue;
                };
                let target = dataset
                    .get_dim(target)
                    .ok_or_else(|| {
                        PagodaError::Internal("grid topology dimension vanished".to_string())
                    })?
                    .clone();
                let relation = dataset.read(topology, net).await?;
                masks.propagate(&cell_dim, &target, &relation, net).await?;
            }
        }
        GridKind::RegularLatLon => {
            let lat_name = grid.get_cell_lat().unwrap().to_string();
            let lon_name = grid.get_cell_lon().unwrap().to_string();
            for (name, min, max) in [
                (lat_name, box_.s, box_.n),
                (lon_name, box_.w, box_.e),
            ] {
                let dim = dataset
                    .get_dim(&name)
                    .ok_or_else(|| {
                        PagodaError::Internal("grid coordinate dimension vanished".to_string())
                    })?
                    .clone();
                let coords = dataset.read(&name, net).await?;
                let slab = pagoda_core::CoordHyperslab::range(&name, min, max);
                masks
                    .get_mask(&dim, net)?
                    .modify_coord(&slab, &coords, net)
                    .await?;
            }
        }
        GridKind::Curvilinear => {
            return Err(PagodaError::NotImplemented(
                "lat/lon boxes over curvilinear grids",
            ));
        }
    }
    Ok(())
}

async fn build_masks<N: Collectives + 'static, D: Dataset<N> + ?Sized>(
    dataset: &D,
    grid: Option<&Grid>,
    options: &CommandOptions,
    net: &N,
) -> Result<MaskMap> {
    let dims: Vec<Dimension> = dataset.get_dims().to_vec();
    let mut masks = MaskMap::new();
    masks.create_masks(&dims, net)?;
    masks.modify_slabs(&options.slabs, &dims, net)?;
    for slab in &options.coord_slabs {
        let Some(dim) = dims.iter().find(|d| d.name == slab.name) else {
            warn!("sliced dimension '{}' does not exist", slab.name);
            continue;
        };
        if dataset.get_var(&dim.name).is_none() {
            return Err(PagodaError::Command(format!(
                "no coordinate variable for dimension '{}'",
                dim.name
            )));
        }
        let coords = dataset.read(&dim.name, net).await?;
        masks
            .get_mask(dim, net)?
            .modify_coord(slab, &coords, net)
            .await?;
    }
    for box_ in &options.boxes {
        if box_.is_global() {
            continue;
        }
        apply_box(dataset, grid, box_, &mut masks, net).await?;
    }
    Ok(masks)
}

/// Read a whole variable, honoring the non-blocking path.
async fn fetch<N: Collectives + 'static, D: Dataset<N> + ?Sized>(
    dataset: &mut D,
    name: &str,
    options: &CommandOptions,
    net: &N,
) -> Result<DistributedArray> {
    if options.nonblocking {
        let handle = dataset.iread(name, net).await?;
        dataset.wait(net).await?;
        Ok(dataset.take(handle).expect("posted read vanished"))
    } else {
        dataset.read(name, net).await
    }
}

async fn fetch_record<N: Collectives + 'static, D: Dataset<N> + ?Sized>(
    dataset: &mut D,
    name: &str,
    record: i64,
    options: &CommandOptions,
    net: &N,
) -> Result<DistributedArray> {
    if options.nonblocking {
        let handle = dataset.iread_record(name, record, net).await?;
        dataset.wait(net).await?;
        Ok(dataset.take(handle).expect("posted read vanished"))
    } else {
        dataset.read_record(name, record, net).await
    }
}

/// Rewrite packed topology values through the target dimension's new dense
/// numbering.
async fn renumber_topology<N: Collectives>(
    packed: &mut DistributedArray,
    target_mask: &Mask,
    net: &N,
) -> Result<()> {
    let index = target_mask.reindex(net).await?;
    let subs: Vec<i64> = if packed.owns_data() {
        packed
            .access()
            .to_f64_vec()?
            .iter()
            .map(|v| *v as i64)
            .collect()
    } else {
        Vec::new()
    };
    let renumbered = index.gather(&subs, net).await?;
    if packed.owns_data() {
        *packed.access_mut() = renumbered.cast_to(packed.get_type())?;
    }
    Ok(())
}

fn mask_refs<'m>(masks: &'m MaskMap, dims: &[Dimension]) -> Vec<&'m DistributedArray> {
    dims.iter()
        .map(|d| masks.get(&d.name).expect("mask missing for dimension").data())
        .collect()
}

/// The masked subset copy: the core of the subsetter command.
pub async fn subset<S, N, D>(
    store: &S,
    dataset: &mut D,
    options: &CommandOptions,
    out_path: &Path,
    cmdline: &str,
    net: &N,
) -> Result<()>
where
    S: VaraStore,
    N: Collectives + 'static,
    D: Dataset<N> + ?Sized,
{
    let grid = Grid::discover(dataset.get_dims(), dataset.get_vars());
    let names = select_variables(dataset.get_vars(), grid.as_ref(), options);
    let mut masks = build_masks(dataset, grid.as_ref(), options, net).await?;

    // masks fix every output extent before any data moves
    let mut out_dims: HashMap<String, Dimension> = HashMap::new();
    for dim in dataset.get_dims().to_vec() {
        let count = masks
            .get_mut(&dim.name)
            .expect("mask missing for dimension")
            .get_count(net)
            .await?;
        out_dims.insert(
            dim.name.clone(),
            Dimension::new(&dim.name, count, dim.unlimited),
        );
    }

    let mut writer = FileWriter::create(
        store,
        out_path,
        &writer_options(options),
        dataset.get_file_format(),
        net,
    )
    .await?;

    let mut atts = dataset.get_atts().to_vec();
    if options.modify_history {
        append_history(&mut atts, cmdline);
    }
    for att in &atts {
        writer.write_att(att)?;
    }

    let selected: Vec<Variable> = names
        .iter()
        .map(|n| dataset.get_var(n).expect("selected variable vanished").clone())
        .collect();
    let mut defined: HashSet<String> = HashSet::new();
    for var in &selected {
        for dim in &var.dims {
            if defined.insert(dim.name.clone()) {
                writer.def_dim(&out_dims[&dim.name])?;
            }
        }
    }
    for var in &selected {
        let out_var = Variable {
            name: var.name.clone(),
            ty: var.ty,
            dims: var.dims.iter().map(|d| out_dims[&d.name].clone()).collect(),
            atts: var.atts.clone(),
        };
        writer.def_var(&out_var)?;
    }

    for var in &selected {
        if var.is_record() && !options.whole_records {
            // stream one record at a time
            let record_dim = &var.dims[0];
            let record_mask = masks
                .get(&record_dim.name)
                .expect("mask missing for record dimension");
            let bits = if record_dim.size > 0 {
                record_mask
                    .data()
                    .get(&[0], &[record_dim.size - 1], net)
                    .await?
                    .to_f64_vec()?
            } else {
                Vec::new()
            };
            let tail = mask_refs(&masks, &var.dims[1..]);
            let mut out_record = 0;
            for (r, bit) in bits.iter().enumerate() {
                if *bit == 0.0 {
                    continue;
                }
                let slab = fetch_record(dataset, &var.name, r as i64, options, net).await?;
                let packed = if tail.is_empty() {
                    slab
                } else {
                    pack_into_new(&slab, &tail, net).await?
                };
                if options.nonblocking {
                    writer.iwrite_record(&packed, &var.name, out_record)?;
                } else {
                    writer.write_record(&packed, &var.name, out_record, net).await?;
                }
                out_record += 1;
            }
        } else {
            let array = fetch(dataset, &var.name, options, net).await?;
            let mut packed = if var.dims.is_empty() {
                array
            } else {
                pack_into_new(&array, &mask_refs(&masks, &var.dims), net).await?
            };
            if let Some(grid) = &grid {
                if grid.is_topology(&var.name) {
                    let target = if grid.get_cell_corners() == Some(var.name.as_str()) {
                        grid.get_corner_dim()
                    } else {
                        grid.get_edge_dim()
                    };
                    if let Some(target_mask) = target.and_then(|t| masks.get(t)) {
                        renumber_topology(&mut packed, target_mask, net).await?;
                    }
                }
            }
            if options.nonblocking {
                writer.iwrite(&packed, &var.name)?;
            } else {
                writer.write(&packed, &var.name, net).await?;
            }
        }
    }
    if options.nonblocking {
        writer.wait(net).await?;
    }
    Ok(())
}

/// Per-record reduction: collapse every record variable to one record.
pub async fn record_reduce<S, N, D>(
    store: &S,
    dataset: &mut D,
    op: ReduceOp,
    options: &CommandOptions,
    out_path: &Path,
    cmdline: &str,
    net: &N,
) -> Result<()>
where
    S: VaraStore,
    N: Collectives + 'static,
    D: Dataset<N> + ?Sized,
{
    let names = select_variables(dataset.get_vars(), None, options);
    let mut writer = FileWriter::create(
        store,
        out_path,
        &writer_options(options),
        dataset.get_file_format(),
        net,
    )
    .await?;

    let mut atts = dataset.get_atts().to_vec();
    if options.modify_history {
        append_history(&mut atts, cmdline);
    }
    for att in &atts {
        writer.write_att(att)?;
    }

    let selected: Vec<Variable> = names
        .iter()
        .map(|n| dataset.get_var(n).expect("selected variable vanished").clone())
        .collect();
    let mut defined: HashSet<String> = HashSet::new();
    for var in &selected {
        for dim in &var.dims {
            if defined.insert(dim.name.clone()) {
                let out = if dim.unlimited {
                    Dimension::record(&dim.name, 1)
                } else {
                    dim.clone()
                };
                writer.def_dim(&out)?;
            }
        }
    }
    for var in &selected {
        let mut out_var = var.clone();
        for dim in out_var.dims.iter_mut() {
            if dim.unlimited {
                dim.size = 1;
            }
        }
        writer.def_var(&out_var)?;
    }

    for var in &selected {
        if !var.is_record() {
            let array = fetch(dataset, &var.name, options, net).await?;
            writer.write(&array, &var.name, net).await?;
            continue;
        }

        let records = var.num_records();
        let tail = var.record_shape();
        let fill = var.get_fill_value();
        // NaN never compares equal, so it stands in for "no fill value"
        let sentinel = fill.unwrap_or(f64::NAN);

        let mut acc = DistributedArray::create(DataType::F64, tail.clone(), net);
        let mut tally = DistributedArray::create(DataType::I32, tail.clone(), net);
        if op.is_extremum() {
            acc.fill_value(if op == ReduceOp::Max {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            })?;
        }

        for r in 0..records {
            let slab = fetch_record(dataset, &var.name, r, options, net).await?;
            let mut value = DistributedArray::create(DataType::F64, tail.clone(), net);
            value.copy_from(&slab, net).await?;
            match op {
                ReduceOp::Max => {
                    acc.combine_counted(&value, sentinel, &mut tally, |a, b| a.max(b))?
                }
                ReduceOp::Min => {
                    acc.combine_counted(&value, sentinel, &mut tally, |a, b| a.min(b))?
                }
                _ if op.squares_input() => {
                    acc.combine_counted(&value, sentinel, &mut tally, |a, b| a + b * b)?
                }
                _ => acc.combine_counted(&value, sentinel, &mut tally, |a, b| a + b)?,
            }
        }

        let mut result = DistributedArray::create(var.ty, tail.clone(), net);
        if result.owns_data() {
            for i in 0..result.get_local_size() as usize {
                let counted = tally.access().get_f64(i)?;
                let value = if counted == 0.0 {
                    fill.unwrap_or(0.0)
                } else {
                    op.finalize(acc.access().get_f64(i)?, counted)
                };
                result.access_mut().set_f64(i, value)?;
            }
        }
        writer.write_record(&result, &var.name, 0, net).await?;
    }
    Ok(())
}

fn check_same_layout(a_dims: &[Dimension], a_vars: &[Variable], b_dims: &[Dimension], b_vars: &[Variable]) -> Result<()> {
    for dim in a_dims {
        match b_dims.iter().find(|d| d.name == dim.name) {
            Some(found) if found == dim => {}
            _ => {
                return Err(PagodaError::DimensionMismatch(format!(
                    "operands disagree on dimension '{}'",
                    dim.name
                )))
            }
        }
    }
    for var in a_vars {
        let found = b_vars.iter().find(|v| v.name == var.name);
        let same = found
            .map(|v| {
                v.ty == var.ty
                    && v.dims.len() == var.dims.len()
                    && v.dims.iter().zip(var.dims.iter()).all(|(x, y)| x.name == y.name)
            })
            .unwrap_or(false);
        if !same {
            return Err(PagodaError::DimensionMismatch(format!(
                "operands disagree on variable '{}'",
                var.name
            )));
        }
    }
    Ok(())
}

/// Elementwise combination of two metadata-identical datasets.
pub async fn binary_combine<S, N, DA, DB>(
    store: &S,
    first: &mut DA,
    second: &mut DB,
    op: BinaryOp,
    options: &CommandOptions,
    out_path: &Path,
    cmdline: &str,
    net: &N,
) -> Result<()>
where
    S: VaraStore,
    N: Collectives + 'static,
    DA: Dataset<N> + ?Sized,
    DB: Dataset<N> + ?Sized,
{
    check_same_layout(
        first.get_dims(),
        first.get_vars(),
        second.get_dims(),
        second.get_vars(),
    )?;
    let names = select_variables(first.get_vars(), None, options);
    let mut writer = FileWriter::create(
        store,
        out_path,
        &writer_options(options),
        first.get_file_format(),
        net,
    )
    .await?;

    let mut atts = first.get_atts().to_vec();
    if options.modify_history {
        append_history(&mut atts, cmdline);
    }
    for att in &atts {
        writer.write_att(att)?;
    }

    let selected: Vec<Variable> = names
        .iter()
        .map(|n| first.get_var(n).expect("selected variable vanished").clone())
        .collect();
    let mut defined: HashSet<String> = HashSet::new();
    for var in &selected {
        for dim in &var.dims {
            if defined.insert(dim.name.clone()) {
                writer.def_dim(dim)?;
            }
        }
    }
    for var in &selected {
        writer.def_var(var)?;
    }

    for var in &selected {
        let mut lhs = fetch(first, &var.name, options, net).await?;
        if var.ty.is_numeric() {
            let rhs = fetch(second, &var.name, options, net).await?;
            op.apply(&mut lhs, &rhs)?;
        }
        writer.write(&lhs, &var.name, net).await?;
    }
    Ok(())
}

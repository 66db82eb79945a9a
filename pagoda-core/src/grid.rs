use crate::dataset::{Dimension, Variable};

/// The built-in grid geometries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridKind {
    /// Icosahedral cell/corner/edge grid with topology variables.
    Geodesic,
    /// Distinct 1-D latitude and longitude coordinate variables.
    RegularLatLon,
    /// 2-D lat/lon center pairs sharing both dimensions.
    Curvilinear,
}

/// A recognized bundle of coordinate and topology variables. The engine
/// never hard-codes coordinate names outside this recognizer; everything
/// downstream goes through the query surface.
#[derive(Clone, Debug)]
pub struct Grid {
    pub kind: GridKind,
    cell_dim: Option<String>,
    corner_dim: Option<String>,
    edge_dim: Option<String>,
    cell_lat: Option<String>,
    cell_lon: Option<String>,
    corner_lat: Option<String>,
    corner_lon: Option<String>,
    edge_lat: Option<String>,
    edge_lon: Option<String>,
    cell_corners: Option<String>,
    cell_edges: Option<String>,
}

fn units_of(var: &Variable) -> Option<String> {
    var.att("units").and_then(|a| a.as_string())
}

fn is_lat_units(var: &Variable) -> bool {
    matches!(
        units_of(var).as_deref(),
        Some("degrees_north") | Some("degree_north") | Some("degrees_N")
    )
}

fn is_lon_units(var: &Variable) -> bool {
    matches!(
        units_of(var).as_deref(),
        Some("degrees_east") | Some("degree_east") | Some("degrees_E")
    )
}

impl Grid {
    /// Inspect variable and dimension names against the known conventions.
    pub fn discover(dims: &[Dimension], vars: &[Variable]) -> Option<Grid> {
        Grid::discover_geodesic(vars)
            .or_else(|| Grid::discover_curvilinear(vars))
            .or_else(|| Grid::discover_regular(dims, vars))
    }

    fn discover_geodesic(vars: &[Variable]) -> Option<Grid> {
        let find = |name: &str| vars.iter().find(|v| v.name == name);
        let cell_lat = find("grid_center_lat")?;
        let cell_lon = find("grid_center_lon")?;
        if cell_lat.ndim() != 1 || cell_lon.dims != cell_lat.dims {
            return None;
        }
        let cell_dim = cell_lat.dims[0].name.clone();

        let pair_dim = |lat: Option<&Variable>, lon: Option<&Variable>| -> Option<String> {
            let lat = lat?;
            let lon = lon?;
            (lat.ndim() == 1 && lon.dims == lat.dims).then(|| lat.dims[0].name.clone())
        };
        let corner_dim = pair_dim(find("grid_corner_lat"), find("grid_corner_lon"));
        let edge_dim = pair_dim(find("grid_edge_lat"), find("grid_edge_lon"));

        let topology = |name: &str| -> Option<String> {
            let var = find(name)?;
            (var.ndim() == 2 && var.dims[0].name == cell_dim).then(|| var.name.clone())
        };

        Some(Grid {
            kind: GridKind::Geodesic,
            cell_corners: topology("cell_corners"),
            cell_edges: topology("cell_edges"),
            cell_lat: Some(cell_lat.name.clone()),
            cell_lon: Some(cell_lon.name.clone()),
            corner_lat: corner_dim.is_some().then(|| "grid_corner_lat".to_string()),
            corner_lon: corner_dim.is_some().then(|| "grid_corner_lon".to_string()),
            edge_lat: edge_dim.is_some().then(|| "grid_edge_lat".to_string()),
            edge_lon: edge_dim.is_some().then(|| "grid_edge_lon".to_string()),
            cell_dim: Some(cell_dim),
            corner_dim,
            edge_dim,
        })
    }

    fn discover_curvilinear(vars: &[Variable]) -> Option<Grid> {
        let lat = vars.iter().find(|v| v.ndim() == 2 && is_lat_units(v))?;
        let lon = vars
            .iter()
            .find(|v| v.ndim() == 2 && is_lon_units(v) && v.dims == lat.dims)?;
        Some(Grid {
            kind: GridKind::Curvilinear,
            cell_dim: None,
            corner_dim: None,
            edge_dim: None,
            cell_lat: Some(lat.name.clone()),
            cell_lon: Some(lon.name.clone()),
            corner_lat: None,
            corner_lon: None,
            edge_lat: None,
            edge_lon: None,
            cell_corners: None,
            cell_edges: None,
        })
    }

    fn discover_regular(dims: &[Dimension], vars: &[Variable]) -> Option<Grid> {
        let coord = |accept: &dyn Fn(&Variable) -> bool, names: &[&str]| -> Option<String> {
            vars.iter()
                .find(|v| {
                    v.ndim() == 1
                        && dims.iter().any(|d| d.name == v.name && d.name == v.dims[0].name)
                        && (accept(v) || names.contains(&v.name.as_str()))
                })
                .map(|v| v.name.clone())
        };
        let lat = coord(&is_lat_units, &["lat", "latitude"])?;
        let lon = coord(&is_lon_units, &["lon", "longitude"])?;
        Some(Grid {
            kind: GridKind::RegularLatLon,
            cell_dim: None,
            corner_dim: None,
            edge_dim: None,
            cell_lat: Some(lat),
            cell_lon: Some(lon),
            corner_lat: None,
            corner_lon: None,
            edge_lat: None,
            edge_lon: None,
            cell_corners: None,
            cell_edges: None,
        })
    }

    pub fn get_cell_dim(&self) -> Option<&str> {
        self.cell_dim.as_deref()
    }

    pub fn get_corner_dim(&self) -> Option<&str> {
        self.corner_dim.as_deref()
    }

    pub fn get_edge_dim(&self) -> Option<&str> {
        self.edge_dim.as_deref()
    }

    pub fn get_cell_lat(&self) -> Option<&str> {
        self.cell_lat.as_deref()
    }

    pub fn get_cell_lon(&self) -> Option<&str> {
        self.cell_lon.as_deref()
    }

    pub fn get_corner_lat(&self) -> Option<&str> {
        self.corner_lat.as_deref()
    }

    pub fn get_corner_lon(&self) -> Option<&str> {
        self.corner_lon.as_deref()
    }

    pub fn get_edge_lat(&self) -> Option<&str> {
        self.edge_lat.as_deref()
    }

    pub fn get_edge_lon(&self) -> Option<&str> {
        self.edge_lon.as_deref()
    }

    pub fn get_cell_corners(&self) -> Option<&str> {
        self.cell_corners.as_deref()
    }

    pub fn get_cell_edges(&self) -> Option<&str> {
        self.cell_edges.as_deref()
    }

    /// Is this variable one of the grid's coordinate variables?
    pub fn is_coordinate(&self, var: &str) -> bool {
        [
            &self.cell_lat,
            &self.cell_lon,
            &self.corner_lat,
            &self.corner_lon,
            &self.edge_lat,
            &self.edge_lon,
        ]
        .iter()
        .any(|name| name.as_deref() == Some(var))
    }

    /// Is this variable one of the grid's topology variables?
    pub fn is_topology(&self, var: &str) -> bool {
        [&self.cell_corners, &self.cell_edges]
            .iter()
            .any(|name| name.as_deref() == Some(var))
    }

    /// Every coordinate and topology variable the grid knows about.
    pub fn special_variables(&self) -> Vec<&str> {
        [
            &self.cell_lat,
            &self.cell_lon,
            &self.corner_lat,
            &self.corner_lon,
            &self.edge_lat,
            &self.edge_lon,
            &self.cell_corners,
            &self.cell_edges,
        ]
        .iter()
        .filter_map(|name| name.as_deref())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Attribute;
    use pagoda_types::DataType;

    fn geodesic_metadata() -> (Vec<Dimension>, Vec<Variable>) {
        let cells = Dimension::fixed("cells", 6);
        let corners = Dimension::fixed("corners", 8);
        let cellcorners = Dimension::fixed("cellcorners", 3);
        let dims = vec![cells.clone(), corners.clone(), cellcorners.clone()];
        let vars = vec![
            Variable::new("grid_center_lat", DataType::F64, vec![cells.clone()]),
            Variable::new("grid_center_lon", DataType::F64, vec![cells.clone()]),
            Variable::new("grid_corner_lat", DataType::F64, vec![corners.clone()]),
            Variable::new("grid_corner_lon", DataType::F64, vec![corners.clone()]),
            Variable::new("cell_corners", DataType::I32, vec![cells.clone(), cellcorners]),
            Variable::new("T", DataType::F64, vec![cells]),
        ];
        (dims, vars)
    }

    #[test]
    fn recognizes_geodesic_bundle() {
        let (dims, vars) = geodesic_metadata();
        let grid = Grid::discover(&dims, &vars).unwrap();
        assert_eq!(grid.kind, GridKind::Geodesic);
        assert_eq!(grid.get_cell_dim(), Some("cells"));
        assert_eq!(grid.get_corner_dim(), Some("corners"));
        assert_eq!(grid.get_edge_dim(), None);
        assert_eq!(grid.get_cell_corners(), Some("cell_corners"));
        assert!(grid.is_coordinate("grid_center_lat"));
        assert!(grid.is_topology("cell_corners"));
        assert!(!grid.is_coordinate("T"));
    }

    #[test]
    fn recognizes_regular_lat_lon() {
        let lat = Dimension::fixed("lat", 4);
        let lon = Dimension::fixed("lon", 8);
        let dims = vec![lat.clone(), lon.clone()];
        let mut lat_var = Variable::new("lat", DataType::F64, vec![lat.clone()]);
        lat_var.atts.push(Attribute::text("units", "degrees_north"));
        let mut lon_var = Variable::new("lon", DataType::F64, vec![lon.clone()]);
        lon_var.atts.push(Attribute::text("units", "degrees_east"));
        let vars = vec![
            lat_var,
            lon_var,
            Variable::new("P", DataType::F32, vec![lat, lon]),
        ];
        let grid = Grid::discover(&dims, &vars).unwrap();
        assert_eq!(grid.kind, GridKind::RegularLatLon);
        assert_eq!(grid.get_cell_lat(), Some("lat"));
        assert_eq!(grid.get_cell_lon(), Some("lon"));
        assert!(grid.is_coordinate("lat"));
        assert!(!grid.is_topology("P"));
    }

    #[test]
    fn plain_metadata_has_no_grid() {
        let n = Dimension::fixed("N", 10);
        let dims = vec![n.clone()];
        let vars = vec![Variable::new("Y", DataType::I32, vec![n])];
        assert!(Grid::discover(&dims, &vars).is_none());
    }
}

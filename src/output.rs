//! reduced coordinates, one row by input sample.

use anyhow::{anyhow, Context};

use ndarray::{Array2, ArrayView1};

use std::path::Path;

const XYZ: [&str; 3] = ["x", "y", "z"];

/// Axis names : x, y, z for up to 3 dimensions, dim0 .. dim{n-1} beyond.
pub fn axis_names(nb_dim: usize) -> Vec<String> {
    if nb_dim <= XYZ.len() {
        XYZ[..nb_dim].iter().map(|s| s.to_string()).collect()
    } else {
        (0..nb_dim).map(|i| format!("dim{}", i)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReducedOutput {
    // same row identifiers as the input feature matrix
    index: Vec<String>,
    columns: Vec<String>,
    values: Array2<f64>,
}

impl ReducedOutput {
    pub fn new(index: Vec<String>, values: Array2<f64>) -> anyhow::Result<Self> {
        if index.len() != values.nrows() {
            return Err(anyhow!(
                "reduced output has {} rows for {} row ids",
                values.nrows(),
                index.len()
            ));
        }
        let columns = axis_names(values.ncols());
        Ok(ReducedOutput {
            index,
            columns,
            values,
        })
    }

    pub fn get_index(&self) -> &[String] {
        &self.index
    }

    pub fn get_columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get_values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// coordinates of sample with given id
    pub fn row(&self, id: &str) -> Option<ArrayView1<'_, f64>> {
        self.index
            .iter()
            .position(|s| s == id)
            .map(|i| self.values.row(i))
    }

    /// dumps coordinates in a csv file, first column holds sample ids
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("could not create {}", path.display()))?;
        let mut header = vec![String::from("id")];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header)?;
        for (id, row) in self.index.iter().zip(self.values.rows()) {
            let mut record = vec![id.clone()];
            record.extend(row.iter().map(|x| format!("{:e}", x)));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        log::debug!("wrote {} reduced samples in {}", self.nrows(), path.display());
        Ok(())
    }
} // end of impl ReducedOutput

//! feature matrix of one-hot encoded aisnps.
//!
//! Rows are samples identified by a string id, columns are encoded markers.
//! A matrix can also carry the metadata columns *gender*, *population*, *superpopulation*,
//! either as text (csv input) or as numeric columns. They are never used as features.

use anyhow::{anyhow, Context};

use indexmap::IndexMap;
use ndarray::{Array2, Axis};

use std::path::Path;

use crate::store::normalize_population_level;

/// columns describing samples, stripped before any numeric processing
pub const METADATA_COLUMNS: [&str; 3] = ["gender", "population", "superpopulation"];

/// returns true if column name is a metadata column
pub fn is_metadata(column: &str) -> bool {
    METADATA_COLUMNS.contains(&column)
}

#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    // row identifiers, one by sample
    index: Vec<String>,
    // names of columns of values
    columns: Vec<String>,
    // (nb sample, nb columns)
    values: Array2<f64>,
    // text metadata columns, each of length nb sample
    metadata: IndexMap<String, Vec<String>>,
}

impl FeatureMatrix {
    /// builds a matrix, checks that index and columns match values shape
    pub fn new(index: Vec<String>, columns: Vec<String>, values: Array2<f64>) -> anyhow::Result<Self> {
        let (nb_row, nb_col) = values.dim();
        if index.len() != nb_row {
            return Err(anyhow!(
                "FeatureMatrix::new index has {} ids but values have {} rows",
                index.len(),
                nb_row
            ));
        }
        if columns.len() != nb_col {
            return Err(anyhow!(
                "FeatureMatrix::new got {} column names but values have {} columns",
                columns.len(),
                nb_col
            ));
        }
        Ok(FeatureMatrix {
            index,
            columns,
            values,
            metadata: IndexMap::new(),
        })
    }

    /// adds a text metadata column (gender, population, ...)
    pub fn with_metadata(mut self, name: &str, column: Vec<String>) -> anyhow::Result<Self> {
        if column.len() != self.index.len() {
            return Err(anyhow!(
                "metadata column {} has {} values, expected {}",
                name,
                column.len(),
                self.index.len()
            ));
        }
        self.metadata.insert(name.to_string(), column);
        Ok(self)
    }

    /// Reads a csv file. First column is the sample id, header gives column names.
    /// Metadata columns are kept as text, all other fields must be numbers.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut rdr = csv::Reader::from_path(path)
            .with_context(|| format!("could not open feature file {}", path.display()))?;
        let headers = rdr.headers()?.clone();
        if headers.len() < 2 {
            return Err(anyhow!(
                "feature file {} needs an index column and at least one column",
                path.display()
            ));
        }
        let names: Vec<&str> = headers.iter().skip(1).collect();
        let columns: Vec<String> = names
            .iter()
            .filter(|n| !is_metadata(n))
            .map(|n| n.to_string())
            .collect();
        let mut metadata = IndexMap::<String, Vec<String>>::new();
        for n in names.iter().filter(|n| is_metadata(n)) {
            metadata.insert(n.to_string(), Vec::new());
        }
        //
        let mut index = Vec::<String>::new();
        let mut flat = Vec::<f64>::new();
        for (num_record, result) in rdr.records().enumerate() {
            let record = result?;
            if record.len() != headers.len() {
                return Err(anyhow!(
                    "record {} has {} fields, expected {}",
                    num_record,
                    record.len(),
                    headers.len()
                ));
            }
            index.push(record[0].to_string());
            for (name, field) in names.iter().zip(record.iter().skip(1)) {
                if let Some(column) = metadata.get_mut(*name) {
                    column.push(field.to_string());
                } else {
                    let val = field.trim().parse::<f64>().map_err(|_| {
                        anyhow!("record {} : could not decode field {} : {:?}", num_record, name, field)
                    })?;
                    flat.push(val);
                }
            }
        }
        let values = Array2::from_shape_vec((index.len(), columns.len()), flat)?;
        log::debug!("read {} samples with {} features from {}", index.len(), columns.len(), path.display());
        //
        Ok(FeatureMatrix {
            index,
            columns,
            values,
            metadata,
        })
    } // end of from_csv

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
        self.index.len()
    }

    /// names of the columns kept as features, in their original order
    pub fn feature_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !is_metadata(c))
            .map(|c| c.as_str())
            .collect()
    }

    /// returns values restricted to non metadata columns, in their existing order
    pub fn numeric_features(&self) -> Array2<f64> {
        let kept: Vec<usize> = (0..self.columns.len())
            .filter(|j| !is_metadata(&self.columns[*j]))
            .collect();
        if kept.len() == self.columns.len() {
            self.values.clone()
        } else {
            self.values.select(Axis(1), &kept)
        }
    }

    /// Returns the text metadata column matching a population granularity
    /// ("Super Population", "super-population" ... all match *superpopulation*).
    pub fn labels(&self, population_level: &str) -> Option<Vec<String>> {
        let level = normalize_population_level(population_level);
        self.metadata
            .iter()
            .find(|(name, _)| normalize_population_level(name) == level)
            .map(|(_, column)| column.clone())
    }
} // end of impl FeatureMatrix

#[cfg(test)]
mod tests {

    use super::*;

    use ndarray::array;
    use std::io::Write;

    fn log_init_test() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sample{}", i)).collect()
    }

    #[test]
    fn strip_numeric_metadata() {
        log_init_test();
        let columns = vec![
            "rs1_A".to_string(),
            "gender".to_string(),
            "rs2_C".to_string(),
            "superpopulation".to_string(),
        ];
        let values = array![[1., 0., 0., 3.], [0., 1., 1., 2.]];
        let matrix = FeatureMatrix::new(ids(2), columns, values).unwrap();
        let numeric = matrix.numeric_features();
        assert_eq!(numeric, array![[1., 0.], [0., 1.]]);
        assert_eq!(matrix.feature_columns(), vec!["rs1_A", "rs2_C"]);
    }

    #[test]
    fn shape_mismatch() {
        let values = array![[1., 0.], [0., 1.]];
        assert!(FeatureMatrix::new(ids(3), vec!["a".into(), "b".into()], values.clone()).is_err());
        assert!(FeatureMatrix::new(ids(2), vec!["a".into()], values).is_err());
    }

    #[test]
    fn read_csv_with_metadata() {
        log_init_test();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sample,rs1_A,rs1_G,population,superpopulation,rs2_T").unwrap();
        writeln!(file, "HG001,1,0,GBR,EUR,1").unwrap();
        writeln!(file, "HG002,0,1,YRI,AFR,0").unwrap();
        writeln!(file, "HG003,1,1,CHB,EAS,1").unwrap();
        file.flush().unwrap();
        //
        let matrix = FeatureMatrix::from_csv(file.path()).unwrap();
        assert_eq!(matrix.nrows(), 3);
        assert_eq!(matrix.get_index()[1], "HG002");
        assert_eq!(matrix.get_columns(), &["rs1_A", "rs1_G", "rs2_T"]);
        assert_eq!(matrix.numeric_features(), array![[1., 0., 1.], [0., 1., 0.], [1., 1., 1.]]);
        let labels = matrix.labels("Super Population").unwrap();
        assert_eq!(labels, vec!["EUR", "AFR", "EAS"]);
        assert_eq!(matrix.labels("population").unwrap()[2], "CHB");
        assert!(matrix.labels("gender").is_none());
    }

    #[test]
    fn read_csv_bad_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sample,rs1_A").unwrap();
        writeln!(file, "HG001,x").unwrap();
        file.flush().unwrap();
        assert!(FeatureMatrix::from_csv(file.path()).is_err());
    }

    #[test]
    fn labels_from_added_metadata() {
        log_init_test();
        let values = array![[1., 0.], [0., 1.], [1., 1.]];
        let matrix = FeatureMatrix::new(ids(3), vec!["rs1_A".into(), "rs2_C".into()], values).unwrap();
        assert!(matrix.labels("superpopulation").is_none());
        // one value by sample is required
        let short = vec!["EUR".to_string(), "AFR".to_string()];
        assert!(matrix.clone().with_metadata("superpopulation", short).is_err());
        //
        let superpopulations = vec!["EUR".to_string(), "AFR".to_string(), "EAS".to_string()];
        let matrix = matrix
            .with_metadata("super-population", superpopulations.clone())
            .unwrap()
            .with_metadata("gender", vec!["1".into(), "2".into(), "1".into()])
            .unwrap();
        assert_eq!(matrix.labels("Super Population").unwrap(), superpopulations);
        assert_eq!(matrix.labels("superpopulation").unwrap(), superpopulations);
        assert!(matrix.labels("population").is_none());
        // text metadata never reaches the numeric features
        assert_eq!(matrix.numeric_features(), array![[1., 0.], [0., 1.], [1., 1.]]);
        assert_eq!(matrix.feature_columns(), vec!["rs1_A", "rs2_C"]);
    }
}

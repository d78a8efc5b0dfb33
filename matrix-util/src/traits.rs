use crate::common_io::Delimiter;

/// Read and write matrices from and to delimited text files
pub trait IoOps {
    type Scalar;
    type Mat;

    /// Read a matrix and, if `hdr_line` is given, the words of that
    /// header line (column names)
    fn read_file_delim_with_header(
        file: &str,
        delim: impl Into<Delimiter>,
        hdr_line: Option<usize>,
    ) -> anyhow::Result<(Self::Mat, Vec<Box<str>>)>;

    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        hdr_line: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        Ok(Self::read_file_delim_with_header(file, delim, hdr_line)?.0)
    }

    fn from_tsv(tsv_file: &str, hdr_line: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t", hdr_line)
    }

    /// Pick the delimiter from the file extension (`.csv[.gz]` or tab)
    fn from_file(file: &str, hdr_line: Option<usize>) -> anyhow::Result<(Self::Mat, Vec<Box<str>>)> {
        Self::read_file_delim_with_header(file, Delimiter::from_file_name(file), hdr_line)
    }

    /// Write a matrix with optional row names (first column) and
    /// column names (header line)
    fn write_file_delim_named(
        &self,
        file: &str,
        delim: &str,
        row_names: Option<&[Box<str>]>,
        column_names: Option<&[Box<str>]>,
    ) -> anyhow::Result<()>;

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()> {
        self.write_file_delim_named(file, delim, None, None)
    }

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    fn to_csv(&self, csv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(csv_file, ",")
    }
}

use crate::common_io::{read_lines_of_types, write_lines, Delimiter};
use crate::traits::IoOps;
use candle_util::candle_core::{Device, Tensor};

impl IoOps for Tensor {
    type Scalar = f32;
    type Mat = Self;

    fn read_file_delim_with_header(
        file: &str,
        delim: impl Into<Delimiter>,
        hdr_line: Option<usize>,
    ) -> anyhow::Result<(Self::Mat, Vec<Box<str>>)> {
        let out = read_lines_of_types::<f32>(file, delim, hdr_line)?;

        if out.lines.is_empty() {
            return Err(anyhow::anyhow!("no data in {}", file));
        }

        let ncols = out.lines[0].len();
        let nrows = out.lines.len();

        if let Some(i) = out.lines.iter().position(|x| x.len() != ncols) {
            return Err(anyhow::anyhow!(
                "{}: row {} has {} fields, expected {}",
                file,
                i,
                out.lines[i].len(),
                ncols
            ));
        }

        let data = out.lines.into_iter().flatten().collect::<Vec<_>>();

        Ok((
            Tensor::from_vec(data, (nrows, ncols), &Device::Cpu)?,
            out.header,
        ))
    }

    fn write_file_delim_named(
        &self,
        file: &str,
        delim: &str,
        row_names: Option<&[Box<str>]>,
        column_names: Option<&[Box<str>]>,
    ) -> anyhow::Result<()> {
        let (nrows, ncols) = self.dims2()?;

        if row_names.is_some_and(|r| r.len() != nrows) {
            return Err(anyhow::anyhow!("row names don't match {} rows", nrows));
        }

        if column_names.is_some_and(|c| c.len() != ncols) {
            return Err(anyhow::anyhow!("column names don't match {} columns", ncols));
        }

        let rows = self
            .to_device(&Device::Cpu)?
            .to_dtype(candle_util::candle_core::DType::F32)?
            .to_vec2::<f32>()?;

        let mut lines: Vec<Box<str>> = Vec::with_capacity(nrows + 1);

        if let Some(cols) = column_names {
            let mut hdr: Vec<&str> = cols.iter().map(|x| x.as_ref()).collect();
            if row_names.is_some() {
                hdr.insert(0, "");
            }
            lines.push(hdr.join(delim).into_boxed_str());
        }

        for (i, row) in rows.iter().enumerate() {
            let mut words: Vec<String> = Vec::with_capacity(ncols + 1);
            if let Some(r) = row_names {
                words.push(r[i].to_string());
            }
            words.extend(row.iter().map(|x| format!("{}", x)));
            lines.push(words.join(delim).into_boxed_str());
        }

        write_lines(&lines, file)
    }
}

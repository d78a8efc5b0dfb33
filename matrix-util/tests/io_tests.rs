use candle_util::candle_core::{Device, Tensor};
use matrix_util::common_io::{create_temp_dir_file, read_lines, write_lines};
use matrix_util::traits::IoOps;

#[test]
fn tensor_io_test() -> anyhow::Result<()> {
    let xx = Tensor::rand(0_f32, 1_f32, (50, 20), &Device::Cpu)?;

    let tsv_file = create_temp_dir_file("txt.gz")?;
    let tsv_file = tsv_file.to_str().unwrap();
    xx.to_tsv(tsv_file)?;

    let yy = Tensor::read_file_delim(tsv_file, "\t", None)?;

    assert_eq!(xx.to_vec2::<f32>()?, yy.to_vec2::<f32>()?);

    Ok(())
}

#[test]
fn tensor_csv_with_header_test() -> anyhow::Result<()> {
    let xx = Tensor::new(&[[1_f32, 0., 3.], [0., 2., 5.]], &Device::Cpu)?;
    let genes: Vec<Box<str>> = vec!["g1".into(), "g2".into(), "g3".into()];

    let csv_file = create_temp_dir_file("csv")?;
    let csv_file = csv_file.to_str().unwrap();
    xx.write_file_delim_named(csv_file, ",", None, Some(&genes))?;

    let (yy, header) = Tensor::from_file(csv_file, Some(0))?;
    assert_eq!(header, genes);
    assert_eq!(xx.to_vec2::<f32>()?, yy.to_vec2::<f32>()?);

    Ok(())
}

#[test]
fn ragged_rows_are_rejected() -> anyhow::Result<()> {
    let file = create_temp_dir_file("tsv")?;
    let file = file.to_str().unwrap();
    let lines: Vec<Box<str>> = vec!["1\t2".into(), "3".into()];
    write_lines(&lines, file)?;
    assert!(Tensor::from_tsv(file, None).is_err());
    Ok(())
}

#[test]
fn lines_io_test() -> anyhow::Result<()> {
    let file = create_temp_dir_file("txt.gz")?;
    let file = file.to_str().unwrap();
    let lines: Vec<Box<str>> = vec!["AAAC".into(), "GGTT".into()];
    write_lines(&lines, file)?;
    assert_eq!(read_lines(file)?, lines);
    Ok(())
}

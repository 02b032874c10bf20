//! I/O utilities.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a string to either standard output or a file, adding a trailing
/// newline if it lacks one.
pub async fn write_output(path: Option<&Path>, output: &str) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    writer
        .write_all(output.as_bytes())
        .await
        .context("Failed to write output")?;
    if !output.ends_with('\n') {
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_output_adds_final_newline() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("out.txt");
        write_output(Some(&path), "hello").await?;
        assert_eq!(std::fs::read_to_string(&path)?, "hello\n");
        write_output(Some(&path), "two\nlines\n").await?;
        assert_eq!(std::fs::read_to_string(&path)?, "two\nlines\n");
        Ok(())
    }
}

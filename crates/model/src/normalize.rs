use std::io::{BufRead, Write};

/// Line level clean-up applied to every artifact before it is published
/// into the staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalization {
    pub strip_carriage_returns: bool,
    /// Field separator removed once from the end of every line.
    pub trailing_delimiter: Option<u8>,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization {
            strip_carriage_returns: true,
            trailing_delimiter: None,
        }
    }
}

impl Normalization {
    /// Copies `reader` into `writer` line by line. Lines are always
    /// terminated by `\n`, including the last one. Returns the number of
    /// lines written.
    pub fn apply<R, W>(&self, mut reader: R, mut writer: W) -> anyhow::Result<u64>
    where
        R: BufRead,
        W: Write,
    {
        let mut lines = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if self.strip_carriage_returns {
                line.retain(|byte| *byte != b'\r');
            }
            if let Some(delimiter) = self.trailing_delimiter {
                if line.last() == Some(&delimiter) {
                    line.pop();
                }
            }
            writer.write_all(&line)?;
            writer.write_all(b"\n")?;
            lines += 1;
        }
        writer.flush()?;
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(rules: Normalization, input: &str) -> anyhow::Result<String> {
        let mut out = Vec::new();
        rules.apply(input.as_bytes(), &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn strips_carriage_returns_and_terminates_last_line() -> anyhow::Result<()> {
        let out = normalize(Normalization::default(), "id,name\r\n1,Alfreds\r\n2,Ana")?;
        assert_eq!(out, "id,name\n1,Alfreds\n2,Ana\n");
        Ok(())
    }

    #[test]
    fn strips_one_trailing_delimiter_per_line() -> anyhow::Result<()> {
        let rules = Normalization {
            strip_carriage_returns: true,
            trailing_delimiter: Some(b';'),
        };
        let out = normalize(rules, "a;b;\r\n1;2;\n3;;;\n")?;
        assert_eq!(out, "a;b\n1;2\n3;;\n");
        Ok(())
    }

    #[test]
    fn keeps_carriage_returns_when_asked() -> anyhow::Result<()> {
        let rules = Normalization {
            strip_carriage_returns: false,
            trailing_delimiter: None,
        };
        let out = normalize(rules, "x\r\n")?;
        assert_eq!(out, "x\r\n");
        Ok(())
    }

    #[test]
    fn empty_input_writes_nothing() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let lines = Normalization::default().apply(&b""[..], &mut out)?;
        assert_eq!(lines, 0);
        assert!(out.is_empty());
        Ok(())
    }
}

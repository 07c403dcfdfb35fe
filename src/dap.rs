use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::GpmError;

const DATA_MARKER: &[u8] = b"\nData:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DapType {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl DapType {
    fn parse(word: &str) -> Option<Self> {
        let kind = match word {
            "Byte" | "Int8" | "UInt8" => DapType::Byte,
            "Int16" => DapType::Int16,
            "UInt16" => DapType::UInt16,
            "Int32" => DapType::Int32,
            "UInt32" => DapType::UInt32,
            "Float32" => DapType::Float32,
            "Float64" => DapType::Float64,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dimension {
    pub name: Option<String>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DapArray {
    pub name: String,
    pub dtype: DapType,
    pub dims: Vec<Dimension>,
    pub data: Vec<f64>,
}

impl DapArray {
    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims
            .iter()
            .position(|dim| dim.name.as_deref() == Some(name))
    }
}

pub type AttributeTable = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DapDataset {
    pub name: String,
    pub arrays: Vec<DapArray>,
    pub attributes: AttributeTable,
}

impl DapDataset {
    pub fn array(&self, name: &str) -> Option<&DapArray> {
        self.arrays.iter().find(|array| array.name == name)
    }

    pub fn global_attribute(&self, key: &str) -> Option<&str> {
        const GLOBAL: [&str; 3] = ["HDF5_GLOBAL", "NC_GLOBAL", "Global"];
        GLOBAL
            .iter()
            .filter_map(|container| self.attributes.get(*container))
            .chain(self.attributes.values())
            .find_map(|attrs| attrs.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
enum Declaration {
    Array {
        name: String,
        dtype: DapType,
        dims: Vec<Dimension>,
    },
    Grid {
        array: Box<Declaration>,
        maps: Vec<Declaration>,
    },
}

pub fn decode(dods: &[u8], das: &str) -> Result<DapDataset, GpmError> {
    let split = dods
        .windows(DATA_MARKER.len())
        .position(|window| window == DATA_MARKER)
        .ok_or_else(|| GpmError::Dap("response has no data section".to_string()))?;
    let dds = std::str::from_utf8(&dods[..split])
        .map_err(|err| GpmError::Dap(format!("DDS is not UTF-8: {err}")))?;
    let (name, declarations) = parse_dds(dds)?;

    let mut cursor = XdrCursor::new(&dods[split + DATA_MARKER.len()..]);
    let mut arrays: Vec<DapArray> = Vec::new();
    for declaration in &declarations {
        match declaration {
            Declaration::Grid { array, maps } => {
                push_unique(&mut arrays, cursor.read_declaration(array)?);
                for map in maps {
                    push_unique(&mut arrays, cursor.read_declaration(map)?);
                }
            }
            array => push_unique(&mut arrays, cursor.read_declaration(array)?),
        }
    }

    Ok(DapDataset {
        name,
        arrays,
        attributes: parse_das(das)?,
    })
}

fn push_unique(arrays: &mut Vec<DapArray>, array: DapArray) {
    if !arrays.iter().any(|existing| existing.name == array.name) {
        arrays.push(array);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
    Punct(char),
}

fn tokenize(input: &str, puncts: &[char], quoted: bool) -> Result<Vec<Token>, GpmError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if puncts.contains(&ch) {
            tokens.push(Token::Punct(ch));
            chars.next();
        } else if quoted && ch == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some(ch) = chars.next() {
                match ch {
                    '\\' => match chars.next() {
                        Some(escaped @ ('"' | '\\')) => text.push(escaped),
                        Some(other) => {
                            text.push('\\');
                            text.push(other);
                        }
                        None => {}
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => text.push(other),
                }
            }
            if !closed {
                return Err(GpmError::Dap("unterminated string in DAS".to_string()));
            }
            tokens.push(Token::Text(text));
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || puncts.contains(&ch) || (quoted && ch == '"') {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

struct Tokens {
    items: Vec<Token>,
    pos: usize,
}

impl Tokens {
    fn peek(&self) -> Option<&Token> {
        self.items.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.items.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn word(&mut self) -> Result<String, GpmError> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word),
            Some(Token::Text(text)) => Ok(text),
            other => Err(GpmError::Dap(format!("expected a name, found {other:?}"))),
        }
    }

    fn expect(&mut self, punct: char) -> Result<(), GpmError> {
        match self.next() {
            Some(Token::Punct(found)) if found == punct => Ok(()),
            other => Err(GpmError::Dap(format!("expected '{punct}', found {other:?}"))),
        }
    }

    fn eat(&mut self, punct: char) -> bool {
        if self.peek() == Some(&Token::Punct(punct)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

fn parse_dds(text: &str) -> Result<(String, Vec<Declaration>), GpmError> {
    let mut tokens = Tokens {
        items: tokenize(text, &['{', '}', '[', ']', ';', '=', ':'], false)?,
        pos: 0,
    };
    let keyword = tokens.word()?;
    if !keyword.eq_ignore_ascii_case("Dataset") {
        return Err(GpmError::Dap(format!("DDS starts with {keyword}")));
    }
    tokens.expect('{')?;
    let mut declarations = Vec::new();
    while !tokens.eat('}') {
        declarations.push(parse_declaration(&mut tokens)?);
    }
    let name = tokens.word()?;
    tokens.expect(';')?;
    Ok((name, declarations))
}

fn parse_declaration(tokens: &mut Tokens) -> Result<Declaration, GpmError> {
    let kind = tokens.word()?;
    if kind.eq_ignore_ascii_case("Grid") {
        tokens.expect('{')?;
        expect_section(tokens, "ARRAY")?;
        let array = parse_declaration(tokens)?;
        expect_section(tokens, "MAPS")?;
        let mut maps = Vec::new();
        while !tokens.eat('}') {
            maps.push(parse_declaration(tokens)?);
        }
        tokens.word()?;
        tokens.expect(';')?;
        return Ok(Declaration::Grid {
            array: Box::new(array),
            maps,
        });
    }

    let dtype = DapType::parse(&kind)
        .ok_or_else(|| GpmError::Dap(format!("unsupported DAP type {kind}")))?;
    let name = tokens.word()?;
    let mut dims = Vec::new();
    while tokens.eat('[') {
        let first = tokens.word()?;
        let (dim_name, size) = if tokens.eat('=') {
            (Some(first), tokens.word()?)
        } else {
            (None, first)
        };
        let size = size
            .parse::<usize>()
            .map_err(|err| GpmError::Dap(format!("bad dimension size {size}: {err}")))?;
        tokens.expect(']')?;
        dims.push(Dimension {
            name: dim_name,
            size,
        });
    }
    tokens.expect(';')?;
    Ok(Declaration::Array { name, dtype, dims })
}

fn expect_section(tokens: &mut Tokens, section: &str) -> Result<(), GpmError> {
    let word = tokens.word()?;
    if !word.eq_ignore_ascii_case(section) {
        return Err(GpmError::Dap(format!("expected {section}:, found {word}")));
    }
    tokens.expect(':')
}

pub fn parse_das(text: &str) -> Result<AttributeTable, GpmError> {
    let mut table = AttributeTable::new();
    if text.trim().is_empty() {
        return Ok(table);
    }
    let mut tokens = Tokens {
        items: tokenize(text, &['{', '}', ';', ','], true)?,
        pos: 0,
    };
    let keyword = tokens.word()?;
    if !keyword.eq_ignore_ascii_case("Attributes") {
        return Err(GpmError::Dap(format!("DAS starts with {keyword}")));
    }
    tokens.expect('{')?;
    while !tokens.eat('}') {
        let name = tokens.word()?;
        tokens.expect('{')?;
        parse_container(&mut tokens, &name, &mut table)?;
    }
    Ok(table)
}

fn parse_container(
    tokens: &mut Tokens,
    path: &str,
    table: &mut AttributeTable,
) -> Result<(), GpmError> {
    table.entry(path.to_string()).or_default();
    while !tokens.eat('}') {
        let first = tokens.word()?;
        if tokens.eat('{') {
            parse_container(tokens, &format!("{path}.{first}"), table)?;
            continue;
        }
        let attribute = tokens.word()?;
        let mut values = vec![tokens.word()?];
        while tokens.eat(',') {
            values.push(tokens.word()?);
        }
        tokens.expect(';')?;
        table
            .entry(path.to_string())
            .or_default()
            .insert(attribute, values.join(", "));
    }
    Ok(())
}

struct XdrCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> XdrCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], GpmError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| GpmError::Dap("truncated XDR payload".to_string()))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32, GpmError> {
        Ok(u32::from_be_bytes(self.take::<4>()?))
    }

    fn read_value(&mut self, dtype: DapType) -> Result<f64, GpmError> {
        let value = match dtype {
            DapType::Byte => f64::from(self.take::<4>()?[3]),
            DapType::Int16 | DapType::Int32 => f64::from(i32::from_be_bytes(self.take::<4>()?)),
            DapType::UInt16 | DapType::UInt32 => f64::from(self.read_u32()?),
            DapType::Float32 => f64::from(f32::from_be_bytes(self.take::<4>()?)),
            DapType::Float64 => f64::from_be_bytes(self.take::<8>()?),
        };
        Ok(value)
    }

    fn read_declaration(&mut self, declaration: &Declaration) -> Result<DapArray, GpmError> {
        let Declaration::Array { name, dtype, dims } = declaration else {
            return Err(GpmError::Dap("nested Grid declarations are not supported".to_string()));
        };

        if dims.is_empty() {
            return Ok(DapArray {
                name: name.clone(),
                dtype: *dtype,
                dims: Vec::new(),
                data: vec![self.read_value(*dtype)?],
            });
        }

        let expected: usize = dims.iter().map(|dim| dim.size).product();
        let count = self.read_u32()? as usize;
        let repeated = self.read_u32()? as usize;
        if count != expected || repeated != expected {
            return Err(GpmError::Dap(format!(
                "{name}: declared {expected} values, payload has {count}/{repeated}"
            )));
        }

        let data = if *dtype == DapType::Byte {
            let end = self.pos + count;
            let raw = self
                .bytes
                .get(self.pos..end)
                .ok_or_else(|| GpmError::Dap("truncated XDR payload".to_string()))?;
            let data = raw.iter().map(|byte| f64::from(*byte)).collect();
            self.pos = end + (4 - count % 4) % 4;
            data
        } else {
            (0..count)
                .map(|_| self.read_value(*dtype))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(DapArray {
            name: name.clone(),
            dtype: *dtype,
            dims: dims.clone(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn xdr_array_f32(values: &[f32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(values.len() as u32).to_be_bytes());
        out.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for value in values {
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }

    #[test]
    fn decodes_grid_and_coordinates() {
        let dds = "Dataset {\n    Grid {\n     ARRAY:\n        Float32 precipitationCal[time = 1][lon = 2][lat = 3];\n     MAPS:\n        Int32 time[time = 1];\n        Float32 lon[lon = 2];\n        Float32 lat[lat = 3];\n    } precipitationCal;\n    Float32 lat[lat = 3];\n} 3B-HHR.MS.MRG.3IMERG.20200101.HDF5;";
        let mut body = dds.as_bytes().to_vec();
        body.extend_from_slice(DATA_MARKER);
        body.extend(xdr_array_f32(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]));
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&7i32.to_be_bytes());
        body.extend(xdr_array_f32(&[-72.05, -71.95]));
        body.extend(xdr_array_f32(&[-33.05, -32.95, -32.85]));
        body.extend(xdr_array_f32(&[-33.05, -32.95, -32.85]));

        let dataset = decode(&body, "").unwrap();
        assert_eq!(dataset.name, "3B-HHR.MS.MRG.3IMERG.20200101.HDF5");
        let names: Vec<_> = dataset.arrays.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["precipitationCal", "time", "lon", "lat"]);
        let precip = dataset.array("precipitationCal").unwrap();
        assert_eq!(precip.dim_index("lat"), Some(2));
        assert_eq!(precip.data[5], 5.0);
        assert_eq!(dataset.array("time").unwrap().data, vec![7.0]);
    }

    #[test]
    fn byte_arrays_are_padded() {
        let dds = "Dataset {\n    Byte q[x = 5];\n    Int16 s;\n} d;";
        let mut body = dds.as_bytes().to_vec();
        body.extend_from_slice(DATA_MARKER);
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(&[1, 2, 3, 4, 5, 0, 0, 0]);
        body.extend_from_slice(&(-3i32).to_be_bytes());

        let dataset = decode(&body, "").unwrap();
        assert_eq!(dataset.array("q").unwrap().data, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(dataset.array("s").unwrap().data, vec![-3.0]);
    }

    #[test]
    fn truncated_payload_fails() {
        let dds = "Dataset {\n    Float32 lat[lat = 3];\n} d;";
        let mut body = dds.as_bytes().to_vec();
        body.extend_from_slice(DATA_MARKER);
        body.extend(xdr_array_f32(&[1.0, 2.0, 3.0]));
        body.truncate(body.len() - 2);
        assert_matches!(decode(&body, ""), Err(GpmError::Dap(_)));
    }

    #[test]
    fn structures_are_rejected() {
        let dds = "Dataset {\n    Structure { Int32 a; } s;\n} d;";
        let mut body = dds.as_bytes().to_vec();
        body.extend_from_slice(DATA_MARKER);
        assert_matches!(decode(&body, ""), Err(GpmError::Dap(_)));
    }

    #[test]
    fn parses_nested_das() {
        let das = r#"Attributes {
    HDF5_GLOBAL {
        String FileHeader "StartTime=2020-01-01T00:00:00.000Z;
StopTime=2020-01-01T00:29:59.999Z;";
        Grid {
            String GridHeader "BinMethod=ARITHMETIC_MEAN;";
        }
    }
    precipitationCal {
        String units "mm/hr";
        Float32 _FillValue -9999.9;
        Int32 flags 1, 2;
    }
}"#;
        let table = parse_das(das).unwrap();
        assert!(table["HDF5_GLOBAL"]["FileHeader"].contains("StopTime=2020-01-01T00:29:59.999Z"));
        assert_eq!(table["HDF5_GLOBAL.Grid"]["GridHeader"], "BinMethod=ARITHMETIC_MEAN;");
        assert_eq!(table["precipitationCal"]["_FillValue"], "-9999.9");
        assert_eq!(table["precipitationCal"]["flags"], "1, 2");
    }
}

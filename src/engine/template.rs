use std::collections::BTreeMap;

use crate::core::candidate::Candidate;
use crate::core::cell::ANGSTROM_TO_BOHR;
use crate::core::composition::element_symbol;

/// Expands `%KEYWORD%` placeholders in an optimizer input template.
///
/// The template is split on `%`; recognized keyword segments are replaced
/// verbatim, everything else passes through unchanged. One trailing newline
/// is trimmed from each expansion, the segments are joined with the empty
/// separator, and a single newline is appended to the result.
pub fn interpret_template(template: &str, candidate: &Candidate) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    for segment in template.split('%') {
        match expand_keyword(segment, candidate) {
            Some(rep) => out.push_str(rep.strip_suffix('\n').unwrap_or(&rep)),
            None => out.push_str(segment),
        }
    }
    out.push('\n');
    out
}

fn num(v: f64) -> String {
    format!("{v:.6}")
}

fn expand_keyword(keyword: &str, c: &Candidate) -> Option<String> {
    let cell = &c.cell;
    let rep = match keyword {
        "a" => num(cell.a),
        "b" => num(cell.b),
        "c" => num(cell.c),
        "alphaDeg" => num(cell.alpha),
        "betaDeg" => num(cell.beta),
        "gammaDeg" => num(cell.gamma),
        "alphaRad" => num(cell.alpha.to_radians()),
        "betaRad" => num(cell.beta.to_radians()),
        "gammaRad" => num(cell.gamma.to_radians()),
        "volume" => num(cell.volume()),
        "gen" => c.generation.to_string(),
        "id" => c.id_number.to_string(),
        "coordsFrac" => {
            let mut s = String::new();
            for atom in &c.atoms {
                let f = cell.to_fractional(&atom.position);
                s.push_str(&format!(
                    "{} {} {} {}\n",
                    element_symbol(atom.atomic_number),
                    num(f.x),
                    num(f.y),
                    num(f.z)
                ));
            }
            s
        }
        "coordsFracId" => {
            let mut s = String::new();
            for atom in &c.atoms {
                let f = cell.to_fractional(&atom.position);
                s.push_str(&format!(
                    "{} {} {} {} {}\n",
                    element_symbol(atom.atomic_number),
                    atom.atomic_number,
                    num(f.x),
                    num(f.y),
                    num(f.z)
                ));
            }
            s
        }
        "cellMatrixAngstrom" => cell_matrix(c, 1.0),
        "cellMatrixBohr" => cell_matrix(c, ANGSTROM_TO_BOHR),
        "cellVector1Angstrom" => cell_vector(c, 0, 1.0),
        "cellVector2Angstrom" => cell_vector(c, 1, 1.0),
        "cellVector3Angstrom" => cell_vector(c, 2, 1.0),
        "cellVector1Bohr" => cell_vector(c, 0, ANGSTROM_TO_BOHR),
        "cellVector2Bohr" => cell_vector(c, 1, ANGSTROM_TO_BOHR),
        "cellVector3Bohr" => cell_vector(c, 2, ANGSTROM_TO_BOHR),
        "POSCAR" => poscar(c),
        _ => return None,
    };
    Some(rep)
}

fn cell_matrix(c: &Candidate, scale: f64) -> String {
    let mut s = String::new();
    for i in 0..3 {
        let v = c.cell.vector(i);
        for e in [v.x, v.y, v.z] {
            s.push_str(&num(e * scale));
            s.push('\t');
        }
        s.push('\n');
    }
    s
}

fn cell_vector(c: &Candidate, i: usize, scale: f64) -> String {
    let v = c.cell.vector(i);
    let mut s = String::new();
    for e in [v.x, v.y, v.z] {
        s.push_str(&num(e * scale));
        s.push('\t');
    }
    s
}

/// VASP POSCAR generator: comment, scale, cell vectors, per-species counts
/// and fractional coordinates with species sorted alphabetically by symbol.
fn poscar(c: &Candidate) -> String {
    let mut s = String::new();
    s.push_str(&c.local_path.display().to_string());
    s.push('\n');
    s.push_str("1.0\n");
    for i in 0..3 {
        let v = c.cell.vector(i);
        s.push_str(&format!("{} {} {} \n", num(v.x), num(v.y), num(v.z)));
    }

    let mut by_symbol: BTreeMap<&'static str, Vec<usize>> = BTreeMap::new();
    for (i, atom) in c.atoms.iter().enumerate() {
        by_symbol
            .entry(element_symbol(atom.atomic_number))
            .or_default()
            .push(i);
    }

    for indices in by_symbol.values() {
        s.push_str(&format!("{} ", indices.len()));
    }
    s.push('\n');
    s.push_str("Direct\n");
    for indices in by_symbol.values() {
        for &i in indices {
            let f = c.cell.to_fractional(&c.atoms[i].position);
            s.push_str(&format!("{} {} {} \n", num(f.x), num(f.y), num(f.z)));
        }
    }
    s
}
